//! Attribute names read or written by the render-session core.

// Files and output.
pub const INPUT_FILE: &str = "input_file";
pub const OUTPUT_FILE: &str = "output_file";
pub const OUTPUT_PATH: &str = "output_path";
pub const OUTPUT_TO_FILE: &str = "output_to_file";
pub const OUTPUT_FILE_TYPE: &str = "output_file_type";
pub const OUTPUT_ALPHA: &str = "output_alpha";
pub const GRAYSCALE_OUTPUT: &str = "grayscale_output";
pub const CONTINUE_TRACE: &str = "continue_trace";
pub const BACKUP_TRACE: &str = "backup_trace";
pub const LIBRARY_PATH: &str = "library_path";
pub const VERBOSE: &str = "verbose";

// Image geometry and display.
pub const WIDTH: &str = "width";
pub const HEIGHT: &str = "height";
pub const DISPLAY: &str = "display";
pub const VERSION: &str = "version";
pub const DISPLAY_GAMMA: &str = "display_gamma";
pub const DISPLAY_GAMMA_TYPE: &str = "display_gamma_type";
pub const FILE_GAMMA: &str = "file_gamma";
pub const FILE_GAMMA_TYPE: &str = "file_gamma_type";
pub const WORKING_GAMMA: &str = "working_gamma";
pub const WORKING_GAMMA_TYPE: &str = "working_gamma_type";
pub const LEGACY_GAMMA_MODE: &str = "legacy_gamma_mode";

// Animation.
pub const CLOCK: &str = "clock";
pub const INITIAL_FRAME: &str = "initial_frame";
pub const FINAL_FRAME: &str = "final_frame";
pub const INITIAL_CLOCK: &str = "initial_clock";
pub const FINAL_CLOCK: &str = "final_clock";
pub const SUBSET_START_FRAME: &str = "subset_start_frame";
pub const SUBSET_END_FRAME: &str = "subset_end_frame";
pub const FRAME_STEP: &str = "frame_step";
pub const CYCLIC_ANIMATION: &str = "cyclic_animation";

// SDL constant declarations.
pub const DECLARE: &str = "declare";
pub const IDENTIFIER: &str = "identifier";
pub const VALUE: &str = "value";

// Text stream routing.
pub const ALL_CONSOLE: &str = "all_console";
pub const DEBUG_CONSOLE: &str = "debug_console";
pub const FATAL_CONSOLE: &str = "fatal_console";
pub const RENDER_CONSOLE: &str = "render_console";
pub const STATISTICS_CONSOLE: &str = "statistics_console";
pub const WARNING_CONSOLE: &str = "warning_console";
pub const ALL_FILE: &str = "all_file";
pub const DEBUG_FILE: &str = "debug_file";
pub const FATAL_FILE: &str = "fatal_file";
pub const RENDER_FILE: &str = "render_file";
pub const STATISTICS_FILE: &str = "statistics_file";
pub const WARNING_FILE: &str = "warning_file";
pub const APPEND_CONSOLE_FILES: &str = "append_console_files";

// Shellouts.
pub const PRE_SCENE_COMMAND: &str = "pre_scene_command";
pub const POST_SCENE_COMMAND: &str = "post_scene_command";
pub const PRE_FRAME_COMMAND: &str = "pre_frame_command";
pub const POST_FRAME_COMMAND: &str = "post_frame_command";
pub const USER_ABORT_COMMAND: &str = "user_abort_command";
pub const FATAL_ERROR_COMMAND: &str = "fatal_error_command";
pub const COMMAND_STRING: &str = "command_string";
pub const RETURN_ACTION: &str = "return_action";

// Message plumbing.
pub const SCENE_ID: &str = "scene_id";
pub const VIEW_ID: &str = "view_id";
pub const ERROR_NUMBER: &str = "error_number";
pub const ENGLISH_TEXT: &str = "english_text";
pub const FILE_NAME: &str = "file_name";
pub const RESOLVED_FILE: &str = "resolved_file";
pub const INCLUDE_FILES: &str = "include_files";
pub const PIXELS_COMPLETED: &str = "pixels_completed";
pub const PIXELS_TOTAL: &str = "pixels_total";

// Pixel messages.
pub const PIXEL_ID: &str = "pixel_id";
pub const PIXEL_SKIP_LIST: &str = "pixel_skip_list";
pub const PIXEL_FINAL: &str = "pixel_final";
pub const PIXEL_SIZE: &str = "pixel_size";
pub const PIXEL_POSITIONS: &str = "pixel_positions";
pub const PIXEL_COLORS: &str = "pixel_colors";
pub const PIXEL_BLOCK: &str = "pixel_block";
pub const LEFT: &str = "left";
pub const TOP: &str = "top";
pub const RIGHT: &str = "right";
pub const BOTTOM: &str = "bottom";
