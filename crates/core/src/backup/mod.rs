//! Render state ("backup") files for continuing an interrupted render.
//!
//! A state file is a fixed 512-byte header followed by length-prefixed
//! records, one per final image message received from the backend. Each
//! record is flushed as soon as it is written so an interrupted render loses
//! at most the record in flight.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::backend::Message;
use crate::files::AccessPolicy;
use crate::options::{keys, Options};
use crate::{FrontendError, Result};

pub const SIGNATURE: &[u8; 28] = b"TRACEFRONT RENDER STATE FILE";
pub const VERSION: &[u8; 4] = b"0001";
pub const HEADER_LEN: usize = 512;
pub const EXTENSION: &str = "tracefront-state";

/// Largest record accepted on replay; anything bigger is treated as damage.
const MAX_RECORD_LEN: u32 = 64 * 1024 * 1024;

fn header() -> [u8; HEADER_LEN] {
    let mut hdr = [0u8; HEADER_LEN];
    hdr[..SIGNATURE.len()].copy_from_slice(SIGNATURE);
    hdr[SIGNATURE.len()..SIGNATURE.len() + VERSION.len()].copy_from_slice(VERSION);
    hdr
}

/// Where the state file for a render lives: next to the output image, named
/// after the output file (or the input file, or `object.pov`).
pub fn backup_path(opts: &Options, output_dir: &Path) -> PathBuf {
    let from_output = Path::new(opts.try_get_str(keys::OUTPUT_FILE, ""))
        .file_name()
        .map(|name| name.to_owned());
    let source = from_output.unwrap_or_else(|| {
        Path::new(opts.try_get_str(keys::INPUT_FILE, "object.pov"))
            .file_name()
            .map(|name| name.to_owned())
            .unwrap_or_else(|| "object.pov".into())
    });
    let stem = Path::new(&source)
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "object".to_owned());
    output_dir.join(format!("{stem}.{EXTENSION}"))
}

/// What a replayed state file says about work already done.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResumeState {
    /// Serial the backend should resume at; every block below it is done.
    pub next_serial: i64,
    /// Blocks at or above `next_serial` that are already done.
    pub skip: Vec<i64>,
    /// Number of intact records.
    pub records: usize,
    /// Byte length of the intact prefix of the file.
    pub valid_len: u64,
}

impl ResumeState {
    /// Highest block id below which everything has been rendered.
    pub fn highest_contiguous(&self) -> Option<i64> {
        (self.next_serial > 0).then_some(self.next_serial - 1)
    }

    fn note_block(&mut self, pixel_id: i64) {
        if pixel_id > self.next_serial {
            self.skip.push(pixel_id);
        } else {
            self.next_serial += 1;
        }
    }
}

/// Append-only writer for one render's state file.
#[derive(Debug)]
pub struct BackupStore {
    path: PathBuf,
    file: File,
}

impl BackupStore {
    /// Starts a fresh state file, replacing any previous one. A stale output
    /// image is deleted so a later continue does not mistake it for a
    /// finished render.
    pub fn create_new(path: &Path, output_file: Option<&Path>, policy: &dyn AccessPolicy) -> Result<Self> {
        if !policy.allow_write(path) {
            return Err(FrontendError::CannotOpenFile(
                "Permission denied to create render state output file.".into(),
            ));
        }
        let mut file = File::create(path)
            .map_err(|_| FrontendError::CannotOpenFile("Cannot create render state output file.".into()))?;
        file.write_all(&header())
            .and_then(|_| file.flush())
            .map_err(|_| FrontendError::FileData("Cannot write header to render state output file.".into()))?;

        if let Some(output) = output_file.filter(|p| !p.as_os_str().is_empty()) {
            if output.is_file() {
                if let Err(err) = fs::remove_file(output) {
                    warn!(%err, output = %output.display(), "could not remove stale output image");
                }
            }
        }
        debug!(path = %path.display(), "created render state file");
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    /// Reads `path` and hands every intact record to `replay`.
    ///
    /// Returns `Ok(None)` when the file does not exist. A bad header is an
    /// error; damage after the header ends the replay at the last intact
    /// record.
    pub fn replay(
        path: &Path,
        policy: &dyn AccessPolicy,
        mut replay: impl FnMut(&Message) -> Result<()>,
    ) -> Result<Option<ResumeState>> {
        if !policy.allow_read(path) {
            return Err(FrontendError::CannotOpenFile(
                "Permission denied to read render state file.".into(),
            ));
        }
        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(_) => {
                return Err(FrontendError::CannotOpenFile(
                    "Cannot open state file from previous render.".into(),
                ))
            }
        };
        let end = file.metadata()?.len();

        let mut hdr = [0u8; HEADER_LEN];
        file.read_exact(&mut hdr)
            .map_err(|_| FrontendError::FileData("Cannot read header from render state file.".into()))?;
        if &hdr[..SIGNATURE.len()] != SIGNATURE {
            return Err(FrontendError::FileData(
                "Render state file header appears to be invalid.".into(),
            ));
        }
        if &hdr[SIGNATURE.len()..SIGNATURE.len() + VERSION.len()] != VERSION {
            return Err(FrontendError::FileData(
                "Render state file was written by another version.".into(),
            ));
        }

        let mut state = ResumeState {
            valid_len: HEADER_LEN as u64,
            ..ResumeState::default()
        };
        while state.valid_len < end {
            let msg = match read_record(&mut file) {
                Ok(msg) => msg,
                Err(err) => {
                    debug!(%err, offset = state.valid_len, "render state file ends in a damaged record");
                    break;
                }
            };
            if let Err(err) = replay(&msg) {
                debug!(%err, "stopping replay at a record that could not be applied");
                break;
            }
            if msg.attrs.contains(keys::PIXEL_ID) {
                state.note_block(msg.attrs.try_get_int(keys::PIXEL_ID, 0));
            }
            state.records += 1;
            state.valid_len = file.stream_position()?;
        }
        Ok(Some(state))
    }

    /// Reopens a replayed state file for appending, dropping any damaged tail.
    pub fn reopen(path: &Path, state: &ResumeState, policy: &dyn AccessPolicy) -> Result<Self> {
        if !policy.allow_write(path) {
            return Err(FrontendError::CannotOpenFile(
                "Permission denied to append to render state file.".into(),
            ));
        }
        let mut file = OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(|_| FrontendError::CannotOpenFile("Cannot append to state output file.".into()))?;
        let len = file.metadata()?.len().min(state.valid_len);
        file.set_len(len)?;
        file.seek(SeekFrom::Start(len))?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    /// Summary of a state file without touching it.
    pub fn inspect(path: &Path) -> Result<ResumeState> {
        Self::replay(path, &crate::files::Unrestricted, |_| Ok(()))?
            .ok_or_else(|| FrontendError::CannotOpenFile(format!("{} does not exist", path.display())))
    }

    pub fn append(&mut self, msg: &Message) -> Result<()> {
        let body = serde_json::to_vec(msg)?;
        let len = u32::try_from(body.len())
            .map_err(|_| FrontendError::InvalidDataSize("image message too large for state file".into()))?;
        self.file.write_all(&len.to_le_bytes())?;
        self.file.write_all(&body)?;
        self.file.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Deletes the state file once the render it describes has finished.
    pub fn discard(self) -> Result<()> {
        let Self { path, file } = self;
        drop(file);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

fn read_record(file: &mut File) -> Result<Message> {
    let mut len = [0u8; 4];
    file.read_exact(&mut len)?;
    let len = u32::from_le_bytes(len);
    if len == 0 || len > MAX_RECORD_LEN {
        return Err(FrontendError::FileData(format!("implausible record length {len}")));
    }
    let mut body = vec![0u8; len as usize];
    file.read_exact(&mut body)?;
    Ok(serde_json::from_slice(&body)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Ident, MessageClass};
    use crate::files::Unrestricted;

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("tracefront-backup-{name}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn block(pixel_id: i64) -> Message {
        Message::with_attrs(
            MessageClass::ViewImage,
            Ident::PixelBlockSet,
            Options::new()
                .with(keys::VIEW_ID, 1)
                .with(keys::PIXEL_ID, pixel_id)
                .with(keys::PIXEL_FINAL, true),
        )
    }

    struct DenyAll;

    impl AccessPolicy for DenyAll {
        fn allow_read(&self, _path: &Path) -> bool {
            false
        }

        fn allow_write(&self, _path: &Path) -> bool {
            false
        }
    }

    #[test]
    fn path_follows_output_then_input() {
        let dir = Path::new("renders");
        let opts = Options::new().with(keys::INPUT_FILE, "scenes/glass.pov");
        assert_eq!(backup_path(&opts, dir), dir.join("glass.tracefront-state"));
        let opts = opts.with(keys::OUTPUT_FILE, "out/final.png");
        assert_eq!(backup_path(&opts, dir), dir.join("final.tracefront-state"));
        assert_eq!(backup_path(&Options::new(), dir), dir.join("object.tracefront-state"));
    }

    #[test]
    fn out_of_order_blocks_become_skip_list() {
        let dir = scratch("order");
        let path = dir.join("scene.tracefront-state");
        let mut store = BackupStore::create_new(&path, None, &Unrestricted).unwrap();
        for id in [0, 1, 3, 2, 5] {
            store.append(&block(id)).unwrap();
        }
        drop(store);

        let mut seen = Vec::new();
        let state = BackupStore::replay(&path, &Unrestricted, |msg| {
            seen.push(msg.attrs.try_get_int(keys::PIXEL_ID, -1));
            Ok(())
        })
        .unwrap()
        .unwrap();
        assert_eq!(seen, vec![0, 1, 3, 2, 5]);
        assert_eq!(state.next_serial, 3);
        assert_eq!(state.skip, vec![3, 5]);
        assert_eq!(state.highest_contiguous(), Some(2));
        assert_eq!(state.records, 5);
    }

    #[test]
    fn damaged_tail_is_dropped_on_reopen() {
        let dir = scratch("tail");
        let path = dir.join("scene.tracefront-state");
        let mut store = BackupStore::create_new(&path, None, &Unrestricted).unwrap();
        store.append(&block(0)).unwrap();
        store.append(&block(1)).unwrap();
        drop(store);
        let intact = fs::metadata(&path).unwrap().len();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[40, 0, 0, 0, b'{', b'"']).unwrap();
        drop(file);

        let state = BackupStore::inspect(&path).unwrap();
        assert_eq!(state.records, 2);
        assert_eq!(state.valid_len, intact);

        let mut store = BackupStore::reopen(&path, &state, &Unrestricted).unwrap();
        store.append(&block(2)).unwrap();
        drop(store);
        let state = BackupStore::inspect(&path).unwrap();
        assert_eq!(state.next_serial, 3);
        assert!(state.skip.is_empty());
    }

    #[test]
    fn bad_header_is_file_data_error() {
        let dir = scratch("header");
        let path = dir.join("scene.tracefront-state");
        fs::write(&path, b"not a state file").unwrap();
        assert!(matches!(BackupStore::inspect(&path), Err(FrontendError::FileData(_))));

        let mut wrong_version = header();
        wrong_version[SIGNATURE.len()..SIGNATURE.len() + 4].copy_from_slice(b"9999");
        fs::write(&path, wrong_version).unwrap();
        assert!(matches!(BackupStore::inspect(&path), Err(FrontendError::FileData(_))));
    }

    #[test]
    fn missing_file_replays_as_none() {
        let dir = scratch("missing");
        let state = BackupStore::replay(&dir.join("absent.tracefront-state"), &Unrestricted, |_| Ok(())).unwrap();
        assert!(state.is_none());
    }

    #[test]
    fn create_new_respects_policy_and_clears_stale_output() {
        let dir = scratch("create");
        let path = dir.join("scene.tracefront-state");
        let err = BackupStore::create_new(&path, None, &DenyAll).unwrap_err();
        assert!(err.is_cannot_open_file());

        let image = dir.join("scene.png");
        fs::write(&image, b"stale").unwrap();
        let store = BackupStore::create_new(&path, Some(&image), &Unrestricted).unwrap();
        assert!(!image.exists());
        assert_eq!(fs::metadata(&path).unwrap().len(), HEADER_LEN as u64);
        store.discard().unwrap();
        assert!(!path.exists());
    }
}
