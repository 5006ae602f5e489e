// Data models
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

/// Where a stem's bytes come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileContent {
    Path(PathBuf),
    Bytes(Arc<[u8]>),
}

impl FileContent {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        FileContent::Bytes(Arc::from(bytes.into()))
    }
}

/// One file as handed over by whatever selected it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFile {
    pub relative_path: String,
    pub extension: String,
    pub content: FileContent,
}

impl RawFile {
    /// Build a file entry, taking the extension from the path
    pub fn new(relative_path: impl Into<String>, content: FileContent) -> Self {
        let relative_path = relative_path.into();
        let extension = file_name(&relative_path)
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_string())
            .unwrap_or_default();
        Self {
            relative_path,
            extension,
            content,
        }
    }

    /// Last path component, whichever separator the source used
    pub fn file_name(&self) -> &str {
        file_name(&self.relative_path)
    }

    /// File name without its extension
    pub fn stem_name(&self) -> &str {
        let name = self.file_name();
        match name.rsplit_once('.') {
            Some((base, ext)) if ext.eq_ignore_ascii_case(self.normalized_extension()) => base,
            _ => name,
        }
    }

    /// Extension without the leading dot
    pub fn normalized_extension(&self) -> &str {
        self.extension.trim_start_matches('.')
    }
}

fn file_name(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Stem {
    pub label: String,
    pub source_relative_path: String,
    /// Restore value; live gain is zero while muted
    pub volume: u8,
    pub muted: bool,
    #[serde(skip)]
    pub content: FileContent,
}

impl Stem {
    /// Gain the output should run at right now
    pub fn live_gain(&self) -> f32 {
        if self.muted {
            0.0
        } else {
            f32::from(self.volume) / 100.0
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Song {
    pub grouping_key: String,
    pub stems: Vec<Stem>,
}

impl Song {
    pub fn stem(&self, label: &str) -> Option<&Stem> {
        self.stems.iter().find(|s| s.label == label)
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.stems.iter().any(|s| s.label == label)
    }
}

/// Songs in playlist order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Library {
    pub songs: Vec<Song>,
}

impl Library {
    pub fn new(songs: Vec<Song>) -> Self {
        Self { songs }
    }

    pub fn len(&self) -> usize {
        self.songs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.songs.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Song> {
        self.songs.get(index)
    }

    pub fn position(&self, grouping_key: &str) -> Option<usize> {
        self.songs.iter().position(|s| s.grouping_key == grouping_key)
    }

    pub fn song(&self, grouping_key: &str) -> Option<&Song> {
        self.songs.iter().find(|s| s.grouping_key == grouping_key)
    }

    pub fn song_mut(&mut self, grouping_key: &str) -> Option<&mut Song> {
        self.songs.iter_mut().find(|s| s.grouping_key == grouping_key)
    }

    /// Find a stem anywhere in the library by the path it was scanned from
    pub fn stem_by_path(&self, relative_path: &str) -> Option<&Stem> {
        self.songs
            .iter()
            .flat_map(|song| song.stems.iter())
            .find(|stem| stem.source_relative_path == relative_path)
    }

    pub fn grouping_keys(&self) -> Vec<String> {
        self.songs.iter().map(|s| s.grouping_key.clone()).collect()
    }
}
