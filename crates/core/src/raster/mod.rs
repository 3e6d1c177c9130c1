//! Render targets: the float image buffer that collects final pixels, the
//! preview display hook, gamma curves, and image file output.

use std::io::{Cursor, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::backend::{Ident, Message};
use crate::options::{keys, Options, Value};
use crate::{FrontendError, Result};

/// Linear colour with transmittance, as produced by the renderer.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Rgbt {
    pub red: f32,
    pub green: f32,
    pub blue: f32,
    pub transmit: f32,
}

impl Rgbt {
    pub fn new(red: f32, green: f32, blue: f32, transmit: f32) -> Self {
        Self {
            red,
            green,
            blue,
            transmit,
        }
    }

    /// Reads one pixel from a five-float record; the fourth channel is unused.
    fn from_record(values: &[f64]) -> Self {
        Self::new(
            values[0] as f32,
            values[1] as f32,
            values[2] as f32,
            values[4] as f32,
        )
    }

    pub fn alpha(&self) -> f32 {
        1.0 - self.transmit
    }

    pub fn greyscale(&self) -> f32 {
        self.red * 0.297 + self.green * 0.589 + self.blue * 0.114
    }

    fn unpremultiplied(self) -> Self {
        let alpha = self.alpha();
        if alpha <= 0.0 || alpha >= 1.0 {
            return self;
        }
        Self {
            red: self.red / alpha,
            green: self.green / alpha,
            blue: self.blue / alpha,
            transmit: self.transmit,
        }
    }
}

/// 8-bit colour handed to a preview display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rgba8 {
    pub red: u8,
    pub green: u8,
    pub blue: u8,
    pub alpha: u8,
}

/// Float image that receives the final pixels of one view.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageBuffer {
    width: u32,
    height: u32,
    pixels: Vec<Rgbt>,
}

impl ImageBuffer {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pixels: vec![Rgbt::default(); width as usize * height as usize],
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn get(&self, x: u32, y: u32) -> Option<Rgbt> {
        self.index(x, y).map(|idx| self.pixels[idx])
    }

    /// Writes one pixel; coordinates outside the image are ignored.
    pub fn set(&mut self, x: u32, y: u32, colour: Rgbt) {
        if let Some(idx) = self.index(x, y) {
            self.pixels[idx] = colour;
        }
    }

    fn index(&self, x: u32, y: u32) -> Option<usize> {
        (x < self.width && y < self.height).then(|| y as usize * self.width as usize + x as usize)
    }
}

/// Preview surface for an in-progress render.
pub trait Display: Send {
    fn draw_pixel(&mut self, x: u32, y: u32, colour: Rgba8);

    fn draw_filled_rectangle(&mut self, left: u32, top: u32, right: u32, bottom: u32, colour: Rgba8) {
        for y in top..=bottom {
            for x in left..=right {
                self.draw_pixel(x, y, colour);
            }
        }
    }

    /// `colours` is row-major over the rectangle.
    fn draw_pixel_block(&mut self, left: u32, top: u32, right: u32, bottom: u32, colours: &[Rgba8]) {
        let mut iter = colours.iter();
        for y in top..=bottom {
            for x in left..=right {
                match iter.next() {
                    Some(colour) => self.draw_pixel(x, y, *colour),
                    None => return,
                }
            }
        }
    }

    fn draw_rectangle_frame(&mut self, left: u32, top: u32, right: u32, bottom: u32, colour: Rgba8) {
        for x in left..=right {
            self.draw_pixel(x, top, colour);
            self.draw_pixel(x, bottom, colour);
        }
        for y in top..=bottom {
            self.draw_pixel(left, y, colour);
            self.draw_pixel(right, y, colour);
        }
    }

    fn show(&mut self) {}
}

/// Builds a display for a view of the given size.
pub type DisplayFactory = Box<dyn FnMut(u32, u32) -> Box<dyn Display> + Send>;

/// Display that keeps its pixels in shared memory.
#[derive(Debug, Clone)]
pub struct MemoryDisplay {
    width: u32,
    height: u32,
    pixels: Arc<Mutex<Vec<Rgba8>>>,
}

impl MemoryDisplay {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pixels: Arc::new(Mutex::new(vec![Rgba8::default(); width as usize * height as usize])),
        }
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<Rgba8> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let pixels = self.pixels.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        pixels.get(y as usize * self.width as usize + x as usize).copied()
    }
}

impl Display for MemoryDisplay {
    fn draw_pixel(&mut self, x: u32, y: u32, colour: Rgba8) {
        if x >= self.width || y >= self.height {
            return;
        }
        let mut pixels = self.pixels.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        pixels[y as usize * self.width as usize + x as usize] = colour;
    }
}

/// Transfer function family named in gamma options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GammaType {
    Neutral,
    Power,
    Srgb,
}

impl GammaType {
    pub fn parse(text: &str) -> Result<Self> {
        match text.trim().to_ascii_lowercase().as_str() {
            "neutral" | "none" => Ok(Self::Neutral),
            "power" => Ok(Self::Power),
            "srgb" => Ok(Self::Srgb),
            other => Err(FrontendError::Param(format!("unknown gamma type '{other}'"))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Neutral => "neutral",
            Self::Power => "power",
            Self::Srgb => "srgb",
        }
    }
}

/// Encoding curve between linear light and stored values.
#[derive(Debug, Clone, PartialEq)]
pub enum GammaCurve {
    Neutral,
    Power(f32),
    Srgb,
    /// Decodes through `working` and re-encodes through `display`.
    Transcoding {
        working: Box<GammaCurve>,
        display: Box<GammaCurve>,
    },
}

pub const DEFAULT_DISPLAY_GAMMA: f32 = 2.2;
pub const DEFAULT_WORKING_GAMMA: f32 = 1.0;

impl GammaCurve {
    pub fn from_type(kind: GammaType, gamma: f32) -> Self {
        match kind {
            GammaType::Neutral => Self::Neutral,
            GammaType::Srgb => Self::Srgb,
            GammaType::Power if (gamma - 1.0).abs() < f32::EPSILON => Self::Neutral,
            GammaType::Power => Self::Power(gamma),
        }
    }

    /// Reads a curve from a `*_gamma_type` / `*_gamma` option pair.
    pub fn from_options(
        opts: &Options,
        type_key: &str,
        gamma_key: &str,
        default_type: GammaType,
        default_gamma: f32,
    ) -> Result<Self> {
        let kind = match opts.get(type_key).and_then(Value::as_str) {
            Some(text) => GammaType::parse(text)?,
            None if opts.contains(gamma_key) => GammaType::Power,
            None => default_type,
        };
        let gamma = opts.try_get_float(gamma_key, f64::from(default_gamma)) as f32;
        if kind == GammaType::Power && gamma < 0.1 {
            return Err(FrontendError::Param(format!("specified {gamma_key} is too small")));
        }
        Ok(Self::from_type(kind, gamma))
    }

    pub fn encode(&self, value: f32) -> f32 {
        let value = value.max(0.0);
        match self {
            Self::Neutral => value,
            Self::Power(gamma) => value.powf(1.0 / gamma),
            Self::Srgb => {
                if value <= 0.003_130_8 {
                    value * 12.92
                } else {
                    1.055 * value.powf(1.0 / 2.4) - 0.055
                }
            }
            Self::Transcoding { working, display } => display.encode(working.decode(value)),
        }
    }

    pub fn decode(&self, value: f32) -> f32 {
        let value = value.max(0.0);
        match self {
            Self::Neutral => value,
            Self::Power(gamma) => value.powf(*gamma),
            Self::Srgb => {
                if value <= 0.040_45 {
                    value / 12.92
                } else {
                    ((value + 0.055) / 1.055).powf(2.4)
                }
            }
            Self::Transcoding { working, display } => working.encode(display.decode(value)),
        }
    }

    pub fn encode_u8(&self, value: f32) -> u8 {
        (self.encode(value).clamp(0.0, 1.0) * 255.0).round() as u8
    }
}

/// How the parsed scene asked for output gamma to be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegacyGammaMode {
    /// No assumed_gamma and an old scene version: no gamma correction.
    None,
    AssumedGamma36,
    AssumedGamma37,
    /// Upgraded from `None` because the options named version 3.7 or later.
    AssumedGamma37Implied,
}

impl LegacyGammaMode {
    pub fn parse(text: &str) -> Result<Self> {
        match text {
            "none" => Ok(Self::None),
            "assumed_gamma_36" => Ok(Self::AssumedGamma36),
            "assumed_gamma_37" => Ok(Self::AssumedGamma37),
            "assumed_gamma_37_implied" => Ok(Self::AssumedGamma37Implied),
            other => Err(FrontendError::Param(format!("unknown gamma handling mode '{other}'"))),
        }
    }
}

/// Gamma facts reported by the parser for one scene.
#[derive(Debug, Clone, PartialEq)]
pub struct SceneGamma {
    pub mode: LegacyGammaMode,
    pub working_type: GammaType,
    pub working_gamma: f32,
}

impl Default for SceneGamma {
    fn default() -> Self {
        Self {
            mode: LegacyGammaMode::AssumedGamma37,
            working_type: GammaType::Power,
            working_gamma: DEFAULT_WORKING_GAMMA,
        }
    }
}

pub const IMPLIED_GAMMA_ADVISORY: &str = "A version of 3.7 or greater was specified in the options, but the scene \
finished parsing with an older version and without assumed_gamma set. Output gamma correction is being turned on \
with an assumed_gamma of 1.0 because the version given in the options takes precedence.";

impl SceneGamma {
    /// Reads the parser's completion message; absent attributes keep defaults.
    pub fn from_parser_attrs(attrs: &Options) -> Result<Self> {
        let mut gamma = Self::default();
        if let Some(mode) = attrs.get(keys::LEGACY_GAMMA_MODE).and_then(Value::as_str) {
            gamma.mode = LegacyGammaMode::parse(mode)?;
        }
        if let Some(kind) = attrs.get(keys::WORKING_GAMMA_TYPE).and_then(Value::as_str) {
            gamma.working_type = GammaType::parse(kind)?;
        }
        gamma.working_gamma = attrs.try_get_float(keys::WORKING_GAMMA, f64::from(gamma.working_gamma)) as f32;
        Ok(gamma)
    }

    /// Picks the display curve for a new view and rewrites the working and
    /// file gamma options to match. Returns the curve plus an advisory when
    /// the handling mode was upgraded.
    pub fn negotiate(&mut self, opts: &mut Options) -> Result<(GammaCurve, Option<&'static str>)> {
        let mut advisory = None;
        if self.mode == LegacyGammaMode::None && opts.try_get_float(keys::VERSION, 0.0) >= 3.7 {
            self.mode = LegacyGammaMode::AssumedGamma37Implied;
            self.working_type = GammaType::Power;
            self.working_gamma = DEFAULT_WORKING_GAMMA;
            advisory = Some(IMPLIED_GAMMA_ADVISORY);
        }

        let display_type = match opts.get(keys::DISPLAY_GAMMA_TYPE).and_then(Value::as_str) {
            Some(text) => GammaType::parse(text)?,
            None => GammaType::Srgb,
        };
        let display_gamma = opts.try_get_float(keys::DISPLAY_GAMMA, f64::from(DEFAULT_DISPLAY_GAMMA)) as f32;

        let curve = match self.mode {
            LegacyGammaMode::None => {
                opts.set(keys::FILE_GAMMA_TYPE, display_type.as_str());
                opts.set(keys::FILE_GAMMA, display_gamma);
                opts.set(keys::WORKING_GAMMA_TYPE, display_type.as_str());
                opts.set(keys::WORKING_GAMMA, display_gamma);
                GammaCurve::Neutral
            }
            LegacyGammaMode::AssumedGamma36
            | LegacyGammaMode::AssumedGamma37
            | LegacyGammaMode::AssumedGamma37Implied => {
                opts.set(keys::WORKING_GAMMA_TYPE, self.working_type.as_str());
                opts.set(keys::WORKING_GAMMA, self.working_gamma);
                GammaCurve::Transcoding {
                    working: Box::new(GammaCurve::from_type(self.working_type, self.working_gamma)),
                    display: Box::new(GammaCurve::from_type(display_type, display_gamma)),
                }
            }
        };
        Ok((curve, advisory))
    }
}

/// Where the pixels of one view go.
pub struct ViewTarget {
    pub image: Option<ImageBuffer>,
    pub display: Option<Box<dyn Display>>,
    pub display_gamma: GammaCurve,
    pub greyscale: bool,
    width: u32,
    height: u32,
}

impl std::fmt::Debug for ViewTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewTarget")
            .field("size", &(self.width, self.height))
            .field("image", &self.image.is_some())
            .field("display", &self.display.is_some())
            .field("display_gamma", &self.display_gamma)
            .field("greyscale", &self.greyscale)
            .finish()
    }
}

impl ViewTarget {
    /// Target for a `width` x `height` view. Rectangles reaching past the
    /// view are rejected; mosaic squares are clipped to it.
    pub fn new(
        width: u32,
        height: u32,
        image: Option<ImageBuffer>,
        display: Option<Box<dyn Display>>,
        display_gamma: GammaCurve,
    ) -> Self {
        Self {
            image,
            display,
            display_gamma,
            greyscale: false,
            width,
            height,
        }
    }

    /// Applies one image message. Only final blocks reach the image buffer;
    /// every block reaches the display.
    pub fn apply(&mut self, msg: &Message) -> Result<()> {
        let final_block = msg.is_final();
        match msg.ident {
            Ident::PixelSet => self.pixel_set(&msg.attrs, final_block),
            Ident::PixelBlockSet => self.pixel_block_set(&msg.attrs, final_block),
            Ident::PixelRowSet => self.pixel_row_set(&msg.attrs, final_block),
            Ident::RectangleFrameSet | Ident::FilledRectangleSet => {
                let (left, top, right, bottom) = self.rect(&msg.attrs)?;
                let colours = msg.attrs.get_float_list(keys::PIXEL_COLORS);
                if colours.len() < 5 {
                    return Err(FrontendError::InvalidDataSize("rectangle message without a colour".into()));
                }
                let colour = display_colour(&self.display_gamma, self.greyscale, Rgbt::from_record(&colours));
                if let Some(display) = self.display.as_mut() {
                    if msg.ident == Ident::FilledRectangleSet {
                        display.draw_filled_rectangle(left, top, right, bottom, colour);
                    } else {
                        display.draw_rectangle_frame(left, top, right, bottom, colour);
                    }
                }
                Ok(())
            }
            other => {
                debug!(?other, "ignoring non-image message");
                Ok(())
            }
        }
    }

    /// Paints a `size` square at (x, y), clipped to the view.
    fn fill(&mut self, x: u32, y: u32, size: u32, colour: Rgbt, final_block: bool) {
        if x >= self.width || y >= self.height {
            return;
        }
        let right = x.saturating_add(size - 1).min(self.width - 1);
        let bottom = y.saturating_add(size - 1).min(self.height - 1);
        if let Some(display) = self.display.as_mut() {
            let rgba = display_colour(&self.display_gamma, self.greyscale, colour);
            if right == x && bottom == y {
                display.draw_pixel(x, y, rgba);
            } else {
                display.draw_filled_rectangle(x, y, right, bottom, rgba);
            }
        }
        if final_block {
            if let Some(image) = self.image.as_mut() {
                for py in y..=bottom {
                    for px in x..=right {
                        image.set(px, py, colour);
                    }
                }
            }
        }
    }

    fn pixel_set(&mut self, attrs: &Options, final_block: bool) -> Result<()> {
        let size = pixel_size(attrs)?;
        let positions = attrs.get_int_list(keys::PIXEL_POSITIONS);
        let colours = attrs.get_float_list(keys::PIXEL_COLORS);
        if positions.len() / 2 != colours.len() / 5 {
            return Err(FrontendError::InvalidDataSize(
                "Number of pixel colors and pixel positions does not match!".into(),
            ));
        }
        for (pos, record) in positions.chunks_exact(2).zip(colours.chunks_exact(5)) {
            let (x, y) = (to_coord(pos[0], "pixel position")?, to_coord(pos[1], "pixel position")?);
            self.fill(x, y, size, Rgbt::from_record(record), final_block);
        }
        Ok(())
    }

    fn pixel_block_set(&mut self, attrs: &Options, final_block: bool) -> Result<()> {
        let (left, top, right, bottom) = self.rect(attrs)?;
        let size = pixel_size(attrs)?;
        let data = attrs.get_float_list(keys::PIXEL_BLOCK);
        let across = span(left, right, size)?;
        let down = span(top, bottom, size)?;
        let cells = across
            .checked_mul(down)
            .and_then(|cells| usize::try_from(cells).ok())
            .ok_or_else(|| FrontendError::InvalidDataSize("pixel block rectangle is too large".into()))?;
        if data.len() / 5 < cells {
            return Err(FrontendError::InvalidDataSize("pixel block is shorter than its rectangle".into()));
        }

        if size == 1 {
            let rgbas: Vec<Rgba8> = data
                .chunks_exact(5)
                .take(cells)
                .map(|record| display_colour(&self.display_gamma, self.greyscale, Rgbt::from_record(record)))
                .collect();
            if let Some(display) = self.display.as_mut() {
                display.draw_pixel_block(left, top, right, bottom, &rgbas);
            }
            if final_block {
                if let Some(image) = self.image.as_mut() {
                    for (idx, record) in data.chunks_exact(5).take(cells).enumerate() {
                        let idx = idx as u32;
                        image.set(left + idx % across, top + idx / across, Rgbt::from_record(record));
                    }
                }
            }
            return Ok(());
        }

        for (idx, record) in data.chunks_exact(5).take(cells).enumerate() {
            let idx = idx as u32;
            let x = left + (idx % across) * size;
            let y = top + (idx / across) * size;
            self.fill(x, y, size, Rgbt::from_record(record), final_block);
        }
        Ok(())
    }

    fn pixel_row_set(&mut self, attrs: &Options, final_block: bool) -> Result<()> {
        let (left, top, right, _) = self.rect(attrs)?;
        let size = pixel_size(attrs)?;
        let colours = attrs.get_float_list(keys::PIXEL_COLORS);
        let count = span(left, right, size)? as usize;
        if colours.len() / 5 < count {
            return Err(FrontendError::InvalidDataSize("pixel row is shorter than its span".into()));
        }
        for (idx, record) in colours.chunks_exact(5).take(count).enumerate() {
            self.fill(left + idx as u32 * size, top, size, Rgbt::from_record(record), final_block);
        }
        Ok(())
    }

    /// Reads the message rectangle; it must lie inside the view.
    fn rect(&self, attrs: &Options) -> Result<(u32, u32, u32, u32)> {
        let left = to_coord(attrs.try_get_int(keys::LEFT, 0), keys::LEFT)?;
        let top = to_coord(attrs.try_get_int(keys::TOP, 0), keys::TOP)?;
        let right = to_coord(attrs.try_get_int(keys::RIGHT, 0), keys::RIGHT)?.max(left);
        let bottom = to_coord(attrs.try_get_int(keys::BOTTOM, 0), keys::BOTTOM)?.max(top);
        if right >= self.width || bottom >= self.height {
            return Err(FrontendError::InvalidDataSize(format!(
                "rectangle {left},{top} to {right},{bottom} lies outside the {}x{} view",
                self.width, self.height
            )));
        }
        Ok((left, top, right, bottom))
    }
}

/// Negative coordinates clamp to zero.
fn to_coord(value: i64, what: &str) -> Result<u32> {
    u32::try_from(value.max(0)).map_err(|_| FrontendError::InvalidDataSize(format!("{what} {value} is out of range")))
}

fn pixel_size(attrs: &Options) -> Result<u32> {
    let size = attrs.try_get_int(keys::PIXEL_SIZE, 1).max(1);
    u32::try_from(size).map_err(|_| FrontendError::InvalidDataSize(format!("pixel size {size} is out of range")))
}

/// Number of `size` squares covering `from..=to`.
fn span(from: u32, to: u32, size: u32) -> Result<u32> {
    ((to - from) / size)
        .checked_add(1)
        .ok_or_else(|| FrontendError::InvalidDataSize("pixel rectangle is too wide".into()))
}

/// Converts a premultiplied linear colour for the preview display.
fn display_colour(gamma: &GammaCurve, greyscale: bool, colour: Rgbt) -> Rgba8 {
    let colour = colour.unpremultiplied();
    let alpha = (colour.alpha().clamp(0.0, 1.0) * 255.0).round() as u8;
    if greyscale {
        let grey = gamma.encode_u8(colour.greyscale());
        return Rgba8 {
            red: grey,
            green: grey,
            blue: grey,
            alpha,
        };
    }
    Rgba8 {
        red: gamma.encode_u8(colour.red),
        green: gamma.encode_u8(colour.green),
        blue: gamma.encode_u8(colour.blue),
        alpha,
    }
}

/// Image file formats the front end can write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Targa,
    Png,
    Ppm,
    Bmp,
}

impl OutputFormat {
    /// Reads `output_file_type`; PNG when absent.
    pub fn from_options(opts: &Options) -> Result<Self> {
        match opts.try_get_str(keys::OUTPUT_FILE_TYPE, "png").to_ascii_lowercase().as_str() {
            "tga" | "targa" | "t" | "c" => Ok(Self::Targa),
            "png" | "n" => Ok(Self::Png),
            "ppm" | "p" => Ok(Self::Ppm),
            "bmp" | "b" => Ok(Self::Bmp),
            other => Err(FrontendError::Param(format!("Invalid file type for output: '{other}'"))),
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Targa => ".tga",
            Self::Png => ".png",
            Self::Ppm => ".ppm",
            Self::Bmp => ".bmp",
        }
    }

    fn image_format(&self) -> ::image::ImageFormat {
        match self {
            Self::Targa => ::image::ImageFormat::Tga,
            Self::Png => ::image::ImageFormat::Png,
            Self::Ppm => ::image::ImageFormat::Pnm,
            Self::Bmp => ::image::ImageFormat::Bmp,
        }
    }

    fn supports_alpha(&self) -> bool {
        matches!(self, Self::Targa | Self::Png)
    }
}

pub fn output_is_stdout(opts: &Options) -> bool {
    matches!(opts.try_get_str(keys::OUTPUT_FILE, ""), "-" | "stdout")
}

pub fn output_is_stderr(opts: &Options) -> bool {
    opts.try_get_str(keys::OUTPUT_FILE, "") == "stderr"
}

/// Computes the image file name for `frame`.
///
/// An empty output name, or one that is only the extension, is derived from
/// the input file. A trailing `.` or the format's own extension is stripped
/// before the zero-padded frame number (when `digits > 0`) and the extension
/// are appended.
pub fn output_filename(opts: &Options, frame: i64, digits: usize) -> Result<String> {
    let format = OutputFormat::from_options(opts)?;
    let ext = format.extension();
    if output_is_stdout(opts) {
        return Ok("stdout".to_owned());
    }
    if output_is_stderr(opts) {
        return Ok("stderr".to_owned());
    }

    let output = opts.try_get_str(keys::OUTPUT_FILE, "");
    let input = opts.try_get_str(keys::INPUT_FILE, "object.pov");
    let out_path = Path::new(output);
    let mut file_name = out_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let output_is_dir = output.ends_with('/') || output.ends_with(std::path::MAIN_SEPARATOR);
    if output_is_dir {
        file_name.clear();
    }

    let dir = if output.is_empty() {
        Path::new(input).parent().map(Path::to_path_buf).unwrap_or_default()
    } else if output_is_dir {
        out_path.to_path_buf()
    } else {
        out_path.parent().map(Path::to_path_buf).unwrap_or_default()
    };

    if file_name.is_empty() || file_name == ext {
        file_name = Path::new(input)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "object.pov".to_owned());
        if let Some(pos) = file_name.rfind('.') {
            file_name.truncate(pos);
        }
    } else if let Some(pos) = file_name.rfind('.') {
        if pos == file_name.len() - 1 || &file_name[pos..] == ext {
            file_name.truncate(pos);
        }
    }

    if digits > 0 {
        file_name.push_str(&format!("{:0width$}", frame.max(0), width = digits));
    }
    file_name.push_str(ext);

    Ok(dir.join(file_name).to_string_lossy().into_owned())
}

/// Writes `image` in the configured format and returns the file name used.
/// Returns an empty name when file output is disabled.
pub fn write_image(opts: &Options, image: &ImageBuffer, frame: i64, digits: usize) -> Result<String> {
    if !opts.try_get_bool(keys::OUTPUT_TO_FILE, true) {
        return Ok(String::new());
    }
    let format = OutputFormat::from_options(opts)?;
    let name = output_filename(opts, frame, digits)?;

    let working = GammaCurve::from_options(
        opts,
        keys::WORKING_GAMMA_TYPE,
        keys::WORKING_GAMMA,
        GammaType::Power,
        DEFAULT_WORKING_GAMMA,
    )?;
    let file = GammaCurve::from_options(
        opts,
        keys::FILE_GAMMA_TYPE,
        keys::FILE_GAMMA,
        GammaType::Srgb,
        DEFAULT_DISPLAY_GAMMA,
    )?;
    let convert = |value: f32| file.encode_u8(working.decode(value));
    let alpha = opts.try_get_bool(keys::OUTPUT_ALPHA, false) && format.supports_alpha();
    let greyscale = opts.try_get_bool(keys::GRAYSCALE_OUTPUT, false) && format != OutputFormat::Ppm;

    let (width, height) = (image.width(), image.height());
    let encoded: ::image::DynamicImage = if greyscale {
        let mut out = ::image::GrayImage::new(width, height);
        for (x, y, px) in out.enumerate_pixels_mut() {
            let colour = image.get(x, y).unwrap_or_default();
            *px = ::image::Luma([convert(colour.greyscale())]);
        }
        out.into()
    } else if alpha {
        let mut out = ::image::RgbaImage::new(width, height);
        for (x, y, px) in out.enumerate_pixels_mut() {
            let colour = image.get(x, y).unwrap_or_default().unpremultiplied();
            let a = (colour.alpha().clamp(0.0, 1.0) * 255.0).round() as u8;
            *px = ::image::Rgba([convert(colour.red), convert(colour.green), convert(colour.blue), a]);
        }
        out.into()
    } else {
        let mut out = ::image::RgbImage::new(width, height);
        for (x, y, px) in out.enumerate_pixels_mut() {
            let colour = image.get(x, y).unwrap_or_default();
            *px = ::image::Rgb([convert(colour.red), convert(colour.green), convert(colour.blue)]);
        }
        out.into()
    };

    if output_is_stdout(opts) || output_is_stderr(opts) {
        let mut buffer = Cursor::new(Vec::new());
        encoded.write_to(&mut buffer, format.image_format())?;
        if output_is_stdout(opts) {
            std::io::stdout().write_all(buffer.get_ref())?;
        } else {
            std::io::stderr().write_all(buffer.get_ref())?;
        }
    } else {
        encoded.save_with_format(&name, format.image_format())?;
    }
    debug!(%name, ?format, "wrote output image");
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MessageClass;

    fn block(view: i64, left: i64, top: i64, right: i64, bottom: i64, final_block: bool, value: f64) -> Message {
        let cells = ((right - left + 1) * (bottom - top + 1)) as usize;
        let mut data = Vec::new();
        for _ in 0..cells {
            data.extend([value, value, value, 0.0, 0.0].map(Value::Float));
        }
        let mut attrs = Options::new()
            .with(keys::VIEW_ID, view)
            .with(keys::PIXEL_SIZE, 1)
            .with(keys::LEFT, left)
            .with(keys::TOP, top)
            .with(keys::RIGHT, right)
            .with(keys::BOTTOM, bottom)
            .with(keys::PIXEL_BLOCK, data);
        if final_block {
            attrs.set(keys::PIXEL_FINAL, true);
        }
        Message::with_attrs(MessageClass::ViewImage, Ident::PixelBlockSet, attrs)
    }

    #[test]
    fn only_final_blocks_reach_the_image() {
        let display = MemoryDisplay::new(4, 4);
        let mut target = ViewTarget::new(
            4,
            4,
            Some(ImageBuffer::new(4, 4)),
            Some(Box::new(display.clone())),
            GammaCurve::Neutral,
        );
        target.apply(&block(1, 0, 0, 1, 1, false, 1.0)).unwrap();
        assert_eq!(target.image.as_ref().unwrap().get(0, 0), Some(Rgbt::default()));
        assert_eq!(display.pixel(1, 1).map(|p| p.red), Some(255));

        target.apply(&block(1, 2, 2, 3, 3, true, 0.5)).unwrap();
        assert_eq!(target.image.as_ref().unwrap().get(3, 3).map(|c| c.red), Some(0.5));
        assert_eq!(display.pixel(3, 3).map(|p| p.red), Some(128));
    }

    #[test]
    fn pixel_set_count_mismatch_is_rejected() {
        let mut target = ViewTarget::new(2, 2, Some(ImageBuffer::new(2, 2)), None, GammaCurve::Neutral);
        let msg = Message::with_attrs(
            MessageClass::ViewImage,
            Ident::PixelSet,
            Options::new()
                .with(keys::PIXEL_SIZE, 1)
                .with(keys::PIXEL_POSITIONS, vec![Value::Int(0), Value::Int(0), Value::Int(1), Value::Int(0)])
                .with(keys::PIXEL_COLORS, vec![Value::Float(1.0); 5]),
        );
        assert!(matches!(target.apply(&msg), Err(FrontendError::InvalidDataSize(_))));
    }

    /// One-colour block whose rectangle is not checked against its data.
    fn wide_block(right: i64, final_block: bool) -> Message {
        let mut attrs = Options::new()
            .with(keys::VIEW_ID, 1)
            .with(keys::PIXEL_SIZE, 1)
            .with(keys::LEFT, 0)
            .with(keys::TOP, 0)
            .with(keys::RIGHT, right)
            .with(keys::BOTTOM, 0)
            .with(keys::PIXEL_BLOCK, vec![Value::Float(1.0); 5]);
        if final_block {
            attrs.set(keys::PIXEL_FINAL, true);
        }
        Message::with_attrs(MessageClass::ViewImage, Ident::PixelBlockSet, attrs)
    }

    #[test]
    fn rectangles_outside_the_view_are_rejected() {
        let mut target = ViewTarget::new(2, 2, Some(ImageBuffer::new(2, 2)), None, GammaCurve::Neutral);
        for right in [2, i64::from(u32::MAX), i64::MAX] {
            assert!(
                matches!(target.apply(&wide_block(right, true)), Err(FrontendError::InvalidDataSize(_))),
                "right edge {right} accepted"
            );
        }
        assert_eq!(target.image.as_ref().unwrap().get(0, 0), Some(Rgbt::default()));

        let frame = Message::with_attrs(
            MessageClass::ViewImage,
            Ident::RectangleFrameSet,
            Options::new()
                .with(keys::LEFT, 0)
                .with(keys::TOP, 0)
                .with(keys::RIGHT, 1)
                .with(keys::BOTTOM, i64::from(u32::MAX))
                .with(keys::PIXEL_COLORS, vec![Value::Float(1.0); 5]),
        );
        assert!(matches!(target.apply(&frame), Err(FrontendError::InvalidDataSize(_))));
    }

    #[test]
    fn mosaic_squares_are_clipped_to_the_view() {
        let display = MemoryDisplay::new(2, 2);
        let mut target = ViewTarget::new(
            2,
            2,
            Some(ImageBuffer::new(2, 2)),
            Some(Box::new(display.clone())),
            GammaCurve::Neutral,
        );
        let square = |size: i64| {
            Message::with_attrs(
                MessageClass::ViewImage,
                Ident::PixelSet,
                Options::new()
                    .with(keys::PIXEL_FINAL, true)
                    .with(keys::PIXEL_SIZE, size)
                    .with(keys::PIXEL_POSITIONS, vec![Value::Int(1), Value::Int(1)])
                    .with(keys::PIXEL_COLORS, [1.0, 1.0, 1.0, 0.0, 0.0].map(Value::Float).to_vec()),
            )
        };
        target.apply(&square(i64::from(u32::MAX))).unwrap();
        let image = target.image.as_ref().unwrap();
        assert_eq!(image.get(1, 1).map(|c| c.red), Some(1.0));
        assert_eq!(image.get(0, 0), Some(Rgbt::default()));
        assert_eq!(display.pixel(1, 1).map(|p| p.red), Some(255));

        assert!(matches!(target.apply(&square(i64::MAX)), Err(FrontendError::InvalidDataSize(_))));
    }

    #[test]
    fn replay_stops_at_an_out_of_range_block() {
        use crate::backup::BackupStore;
        use crate::files::Unrestricted;

        let dir = std::env::temp_dir().join(format!("tracefront-raster-replay-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("scene.tracefront-state");
        let mut store = BackupStore::create_new(&path, None, &Unrestricted).unwrap();
        store.append(&block(1, 0, 0, 1, 0, true, 0.5)).unwrap();
        store.append(&wide_block(i64::from(u32::MAX), true)).unwrap();
        store.append(&block(1, 0, 1, 1, 1, true, 0.25)).unwrap();
        drop(store);

        let mut target = ViewTarget::new(2, 2, Some(ImageBuffer::new(2, 2)), None, GammaCurve::Neutral);
        let state = BackupStore::replay(&path, &Unrestricted, |msg| target.apply(msg))
            .unwrap()
            .unwrap();
        assert_eq!(state.records, 1);
        assert!(state.valid_len < std::fs::metadata(&path).unwrap().len());
        let image = target.image.as_ref().unwrap();
        assert_eq!(image.get(1, 0).map(|c| c.red), Some(0.5));
        assert_eq!(image.get(0, 1), Some(Rgbt::default()));
    }

    #[test]
    fn output_names_follow_input_and_frame() {
        let opts = Options::new()
            .with(keys::INPUT_FILE, "scenes/glass.pov")
            .with(keys::OUTPUT_FILE_TYPE, "png");
        assert_eq!(output_filename(&opts, 7, 3).unwrap(), Path::new("scenes").join("glass007.png").to_string_lossy());
        assert_eq!(output_filename(&opts, 7, 0).unwrap(), Path::new("scenes").join("glass.png").to_string_lossy());

        let named = opts.clone().with(keys::OUTPUT_FILE, "out/final.png");
        assert_eq!(output_filename(&named, 12, 2).unwrap(), Path::new("out").join("final12.png").to_string_lossy());

        let bare_ext = opts.clone().with(keys::OUTPUT_FILE, ".png");
        assert_eq!(output_filename(&bare_ext, 1, 0).unwrap(), "glass.png");

        let stdout = opts.with(keys::OUTPUT_FILE, "-");
        assert_eq!(output_filename(&stdout, 1, 2).unwrap(), "stdout");
    }

    #[test]
    fn unknown_legacy_gamma_mode_is_an_error() {
        let attrs = Options::new().with(keys::LEGACY_GAMMA_MODE, "assumed_gamma_99");
        assert!(SceneGamma::from_parser_attrs(&attrs).is_err());
    }

    #[test]
    fn old_scene_upgrades_when_options_name_new_version() {
        let mut gamma = SceneGamma {
            mode: LegacyGammaMode::None,
            ..SceneGamma::default()
        };
        let mut opts = Options::new().with(keys::VERSION, 3.7);
        let (curve, advisory) = gamma.negotiate(&mut opts).unwrap();
        assert!(advisory.is_some());
        assert_eq!(gamma.mode, LegacyGammaMode::AssumedGamma37Implied);
        assert!(matches!(curve, GammaCurve::Transcoding { .. }));

        let mut old = SceneGamma {
            mode: LegacyGammaMode::None,
            ..SceneGamma::default()
        };
        let mut opts = Options::new().with(keys::VERSION, 3.6);
        let (curve, advisory) = old.negotiate(&mut opts).unwrap();
        assert_eq!(curve, GammaCurve::Neutral);
        assert!(advisory.is_none());
        assert_eq!(opts.try_get_str(keys::FILE_GAMMA_TYPE, ""), "srgb");
    }

    #[test]
    fn srgb_encode_decode_are_inverse() {
        let curve = GammaCurve::Srgb;
        for value in [0.0_f32, 0.002, 0.2, 0.5, 1.0] {
            assert!((curve.decode(curve.encode(value)) - value).abs() < 1e-4);
        }
    }

    #[test]
    fn writes_image_file() {
        let dir = std::env::temp_dir().join(format!("tracefront-raster-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let target = dir.join("frame.png");
        let opts = Options::new()
            .with(keys::OUTPUT_FILE, target.to_string_lossy().into_owned())
            .with(keys::OUTPUT_FILE_TYPE, "png");
        let mut image = ImageBuffer::new(3, 2);
        image.set(1, 1, Rgbt::new(1.0, 0.0, 0.0, 0.0));
        let name = write_image(&opts, &image, 1, 0).unwrap();
        assert_eq!(Path::new(&name), target);
        let decoded = ::image::open(&target).unwrap().to_rgb8();
        assert_eq!(decoded.get_pixel(1, 1).0, [255, 0, 0]);
        assert_eq!(decoded.get_pixel(0, 0).0, [0, 0, 0]);
    }

    #[test]
    fn disabled_output_writes_nothing() {
        let opts = Options::new().with(keys::OUTPUT_TO_FILE, false);
        assert_eq!(write_image(&opts, &ImageBuffer::new(1, 1), 1, 0).unwrap(), "");
    }
}
