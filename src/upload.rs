use crate::error::MergeError;
use bytes::Bytes;
use serde::Serialize;
use std::path::Path;

/// Container extensions accepted by the upload slots.
pub const ALLOWED_EXTENSIONS: [&str; 6] = ["mp4", "mkv", "avi", "mov", "flv", "webm"];

pub const MIN_CLIPS: u8 = 2;
pub const MAX_CLIPS: u8 = 5;

/// Number of videos the user asked to merge, always within 2..=5.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ClipCount(u8);

impl ClipCount {
    pub fn new(count: u8) -> Result<Self, MergeError> {
        if (MIN_CLIPS..=MAX_CLIPS).contains(&count) {
            Ok(Self(count))
        } else {
            Err(MergeError::InvalidCount(count.to_string()))
        }
    }

    pub fn get(&self) -> usize {
        self.0 as usize
    }
}

impl std::str::FromStr for ClipCount {
    type Err = MergeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim();
        let count = raw
            .parse::<u8>()
            .map_err(|_| MergeError::InvalidCount(raw.to_string()))?;
        Self::new(count)
    }
}

/// Lowercased extension of `name` if it is on the allow-list.
pub fn allowed_extension(name: &str) -> Option<String> {
    let ext = Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())?
        .to_ascii_lowercase();
    ALLOWED_EXTENSIONS.contains(&ext.as_str()).then_some(ext)
}

#[derive(Clone, Debug)]
pub struct UploadedFile {
    pub name: String,
    pub extension: String,
    pub content: Bytes,
}

impl UploadedFile {
    /// Accepts the file only when its extension is allow-listed.
    pub fn new(name: impl Into<String>, content: Bytes) -> Result<Self, MergeError> {
        let name = name.into();
        let Some(extension) = allowed_extension(&name) else {
            return Err(MergeError::UnsupportedFormat { name });
        };

        Ok(Self {
            name,
            extension,
            content,
        })
    }

    pub fn len(&self) -> usize {
        self.content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectState {
    Collecting,
    Ready,
}

/// The N upload slots of one merge request.
#[derive(Debug)]
pub struct UploadSet {
    slots: Vec<Option<UploadedFile>>,
}

impl UploadSet {
    pub fn new(count: ClipCount) -> Self {
        Self {
            slots: vec![None; count.get()],
        }
    }

    pub fn count(&self) -> usize {
        self.slots.len()
    }

    pub fn filled(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn state(&self) -> CollectState {
        if self.filled() == self.count() {
            CollectState::Ready
        } else {
            CollectState::Collecting
        }
    }

    /// Puts `file` into the zero-based `slot`, replacing a previous upload.
    pub fn accept(&mut self, slot: usize, file: UploadedFile) -> Result<(), MergeError> {
        let count = self.count();
        let Some(entry) = self.slots.get_mut(slot) else {
            return Err(MergeError::InvalidSlot { slot, count });
        };
        *entry = Some(file);
        Ok(())
    }

    /// Files in slot order, only once every slot is filled.
    pub fn into_files(self) -> Result<Vec<UploadedFile>, MergeError> {
        if self.state() == CollectState::Collecting {
            return Err(MergeError::Incomplete {
                expected: self.count(),
                received: self.filled(),
            });
        }

        Ok(self.slots.into_iter().flatten().collect())
    }
}
