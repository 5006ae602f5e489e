//! Groups a flat list of files into songs made of stems.
//!
//! Each file name (without extension) is tested against the filename rules in
//! order. The first rule that matches names the stem, and whatever is left of
//! the name once the match is cut out becomes the song's grouping key. Files
//! that match no rule form a single-stem song labelled [`DEFAULT_STEM_LABEL`].

use regex::{Regex, RegexBuilder};
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::library::models::{Library, RawFile, Song, Stem};
use crate::settings::{FilenameRule, VolumeSettings};

/// List of supported audio file extensions
pub const SUPPORTED_EXTENSIONS: &[&str] = &["flac", "wav", "mp3", "m4a", "aac", "ogg"];

/// Label for a file no rule matched
pub const DEFAULT_STEM_LABEL: &str = "Main";

const LEADING_SEPARATORS: &[char] = &['_', '-', '.', ')', ']', '}'];
const TRAILING_SEPARATORS: &[char] = &['_', '-', '.', '(', '[', '{'];
const CLOSING_BRACKETS: &[char] = &[')', ']', '}'];

pub fn is_supported_extension(extension: &str) -> bool {
    let extension = extension.trim_start_matches('.');
    SUPPORTED_EXTENSIONS
        .iter()
        .any(|supported| supported.eq_ignore_ascii_case(extension))
}

struct CompiledRule {
    regex: Regex,
    label: String,
}

/// Where a single file lands
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StemName {
    pub grouping_key: String,
    pub label: String,
}

pub struct StemGrouper<'a> {
    rules: Vec<CompiledRule>,
    default_volume: u8,
    saved_volumes: Option<&'a VolumeSettings>,
}

impl<'a> StemGrouper<'a> {
    pub fn new(rules: &[FilenameRule], default_volume: u8) -> Self {
        let rules = rules
            .iter()
            .filter_map(|rule| {
                match RegexBuilder::new(&rule.pattern).case_insensitive(true).build() {
                    Ok(regex) => Some(CompiledRule {
                        regex,
                        label: rule.label.clone(),
                    }),
                    Err(e) => {
                        warn!("Ignoring filename rule '{}': {}", rule.pattern, e);
                        None
                    }
                }
            })
            .collect();

        Self {
            rules,
            default_volume: default_volume.min(100),
            saved_volumes: None,
        }
    }

    /// Volumes persisted in the config, used for stems the previous library didn't know
    pub fn with_saved_volumes(mut self, saved: &'a VolumeSettings) -> Self {
        self.saved_volumes = Some(saved);
        self
    }

    /// Work out the grouping key and stem label for an extensionless file name
    pub fn classify(&self, name: &str) -> StemName {
        // Stem tags are usually bracketed ("Song_(Bass)"), so a rule anchored at
        // the end also gets a try against the name with closing brackets dropped
        let unbracketed = name.trim_end_matches(CLOSING_BRACKETS);

        for rule in &self.rules {
            let candidates = if unbracketed.len() == name.len() {
                [name, ""]
            } else {
                [name, unbracketed]
            };

            for candidate in candidates.iter().filter(|c| !c.is_empty()) {
                if let Some(found) = rule.regex.find(candidate) {
                    let remainder =
                        format!("{}{}", &candidate[..found.start()], &candidate[found.end()..]);
                    let key = trim_separators(&remainder);
                    return StemName {
                        grouping_key: if key.is_empty() {
                            name.to_string()
                        } else {
                            key.to_string()
                        },
                        label: rule.label.clone(),
                    };
                }
            }
        }

        StemName {
            grouping_key: name.to_string(),
            label: DEFAULT_STEM_LABEL.to_string(),
        }
    }

    /// Build the library. Stems keep file order within a song and songs keep
    /// the order their first file appeared in.
    pub fn group(&self, files: &[RawFile], existing: Option<&Library>) -> Library {
        let mut songs: Vec<Song> = Vec::new();
        let mut index_by_key: HashMap<String, usize> = HashMap::new();

        for file in files {
            if !is_supported_extension(&file.extension) {
                debug!("Skipping unsupported file {}", file.relative_path);
                continue;
            }

            let StemName {
                grouping_key,
                label,
            } = self.classify(file.stem_name());

            let (volume, muted) = self.initial_volume(file, &grouping_key, &label, existing);
            let stem = Stem {
                label,
                source_relative_path: file.relative_path.clone(),
                volume,
                muted,
                content: file.content.clone(),
            };

            match index_by_key.get(&grouping_key) {
                Some(&index) => songs[index].stems.push(stem),
                None => {
                    index_by_key.insert(grouping_key.clone(), songs.len());
                    songs.push(Song {
                        grouping_key,
                        stems: vec![stem],
                    });
                }
            }
        }

        debug!("Grouped {} files into {} songs", files.len(), songs.len());
        Library::new(songs)
    }

    fn initial_volume(
        &self,
        file: &RawFile,
        grouping_key: &str,
        label: &str,
        existing: Option<&Library>,
    ) -> (u8, bool) {
        if let Some(previous) = existing.and_then(|lib| lib.stem_by_path(&file.relative_path)) {
            return (previous.volume, previous.muted);
        }

        self.saved_volumes
            .and_then(|saved| saved.get(grouping_key))
            .and_then(|stems| stems.get(label))
            .map(|setting| (setting.volume.min(100), setting.muted))
            .unwrap_or((self.default_volume, false))
    }
}

fn trim_separators(value: &str) -> &str {
    value
        .trim_start_matches(|c: char| c.is_whitespace() || LEADING_SEPARATORS.contains(&c))
        .trim_end_matches(|c: char| c.is_whitespace() || TRAILING_SEPARATORS.contains(&c))
}

/// Group files with the given rules; see [`StemGrouper`] for the details.
pub fn group(
    files: &[RawFile],
    rules: &[FilenameRule],
    existing: Option<&Library>,
    default_volume: u8,
) -> Library {
    StemGrouper::new(rules, default_volume).group(files, existing)
}
