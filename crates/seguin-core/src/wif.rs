//! Reader for WIF (Weaving Information File) patterns.
//!
//! WIF is an INI dialect: `[SECTION]` headers followed by `key=value` lines.
//! Section and key names are case-insensitive and `;` starts a comment line.

use crate::pattern::{PatternData, PatternError, ReducedPattern};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatternFileError {
    #[error("{extension} files are not supported; convert {name:?} to .wif first")]
    UnsupportedFormat {
        name: String,
        extension: &'static str,
    },
    #[error("unsupported file type {name:?}: expected a .wif file")]
    UnsupportedFileType { name: String },
    #[error("could not read pattern {name:?}: {source}")]
    Pattern {
        name: String,
        #[source]
        source: PatternError,
    },
}

/// Turns the text of a pattern file into format-neutral pattern data.
pub trait PatternReader: Sync {
    /// Lowercase file extension, including the dot.
    fn extension(&self) -> &'static str;
    fn read(&self, text: &str) -> Result<PatternData, PatternError>;
}

pub struct WifReader;

static WIF_READER: WifReader = WifReader;

/// Pick a reader by file name extension.
pub fn reader_for(name: &str) -> Result<&'static dyn PatternReader, PatternFileError> {
    let lower = name.to_ascii_lowercase();
    if lower.ends_with(WIF_READER.extension()) {
        return Ok(&WIF_READER);
    }
    if lower.ends_with(".dtx") {
        return Err(PatternFileError::UnsupportedFormat {
            name: name.to_string(),
            extension: ".dtx",
        });
    }
    Err(PatternFileError::UnsupportedFileType {
        name: name.to_string(),
    })
}

/// Read and reduce a pattern file, named by its file name.
pub fn read_pattern(name: &str, text: &str) -> Result<ReducedPattern, PatternFileError> {
    let reader = reader_for(name)?;
    reader
        .read(text)
        .and_then(|data| ReducedPattern::from_pattern_data(name, &data))
        .map_err(|source| PatternFileError::Pattern {
            name: name.to_string(),
            source,
        })
}

impl PatternReader for WifReader {
    fn extension(&self) -> &'static str {
        ".wif"
    }

    fn read(&self, text: &str) -> Result<PatternData, PatternError> {
        let ini = Ini::parse(text)?;
        let weaving = ini
            .section("weaving")
            .ok_or(PatternError::MissingSection("WEAVING"))?;

        let mut data = PatternData {
            num_shafts: weaving
                .get("shafts")
                .ok_or(PatternError::MissingKey {
                    section: "WEAVING",
                    key: "Shafts",
                })
                .and_then(|value| parse_number("weaving", "shafts", value))?,
            ..PatternData::default()
        };
        if let Some(value) = weaving.get("rising shed") {
            data.rising_shed = parse_bool("weaving", "rising shed", value)?;
        }

        if let Some(warp) = ini.section("warp") {
            if let Some(value) = warp.get("threads") {
                data.warp_threads = parse_number("warp", "threads", value)?;
            }
            if let Some(value) = warp.get("color") {
                data.warp_color = Some(parse_color_index("warp", "color", value)?);
            }
        }
        if let Some(weft) = ini.section("weft") {
            if let Some(value) = weft.get("threads") {
                data.weft_threads = parse_number("weft", "threads", value)?;
            }
            if let Some(value) = weft.get("color") {
                data.weft_color = Some(parse_color_index("weft", "color", value)?);
            }
        }

        if let Some(range) = ini
            .section("color palette")
            .and_then(|palette| palette.get("range"))
        {
            let bounds = parse_list("color palette", "range", range)?;
            let [min, max] = bounds[..] else {
                return Err(invalid("color palette", "range", range));
            };
            data.color_range = (min as u32, max as u32);
        }

        if let Some(table) = ini.section("color table") {
            for (key, value) in table.entries() {
                let index = parse_number("color table", key, key)?;
                let components = parse_list("color table", key, value)?;
                let [r, g, b] = components[..] else {
                    return Err(invalid("color table", key, value));
                };
                data.color_table.insert(index, [r as u32, g as u32, b as u32]);
            }
        }

        data.warp_colors = read_index_map(&ini, "warp colors")?;
        data.weft_colors = read_index_map(&ini, "weft colors")?;
        data.threading = read_set_map(&ini, "threading")?;
        data.tieup = read_set_map(&ini, "tieup")?;
        data.treadling = read_set_map(&ini, "treadling")?;
        data.liftplan = read_set_map(&ini, "liftplan")?;
        Ok(data)
    }
}

struct Section {
    entries: Vec<(String, String)>,
}

impl Section {
    fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

struct Ini {
    sections: BTreeMap<String, Section>,
}

impl Ini {
    fn parse(text: &str) -> Result<Self, PatternError> {
        let mut sections: BTreeMap<String, Section> = BTreeMap::new();
        let mut current: Option<String> = None;
        for (index, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with(';') {
                continue;
            }
            if let Some(header) = line.strip_prefix('[') {
                let name = header
                    .strip_suffix(']')
                    .ok_or_else(|| PatternError::Syntax {
                        line: index + 1,
                        message: format!("unterminated section header {line:?}"),
                    })?
                    .trim()
                    .to_ascii_lowercase();
                sections
                    .entry(name.clone())
                    .or_insert_with(|| Section {
                        entries: Vec::new(),
                    });
                current = Some(name);
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(PatternError::Syntax {
                    line: index + 1,
                    message: format!("expected key=value, got {line:?}"),
                });
            };
            let Some(section) = current.as_ref().and_then(|name| sections.get_mut(name)) else {
                return Err(PatternError::Syntax {
                    line: index + 1,
                    message: "entry before the first section header".to_string(),
                });
            };
            section
                .entries
                .push((key.trim().to_ascii_lowercase(), value.trim().to_string()));
        }
        Ok(Self { sections })
    }

    fn section(&self, name: &str) -> Option<&Section> {
        self.sections.get(name)
    }
}

fn invalid(section: &str, key: &str, value: &str) -> PatternError {
    PatternError::InvalidValue {
        section: section.to_ascii_uppercase(),
        key: key.to_string(),
        value: value.to_string(),
    }
}

fn parse_number(section: &str, key: &str, value: &str) -> Result<usize, PatternError> {
    value.trim().parse().map_err(|_| invalid(section, key, value))
}

fn parse_list(section: &str, key: &str, value: &str) -> Result<Vec<usize>, PatternError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| parse_number(section, key, item))
        .collect()
}

fn parse_bool(section: &str, key: &str, value: &str) -> Result<bool, PatternError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        _ => Err(invalid(section, key, value)),
    }
}

/// Colour entries may carry extra comma-separated fields; the index is first.
fn parse_color_index(section: &str, key: &str, value: &str) -> Result<usize, PatternError> {
    let first = value.split(',').next().unwrap_or_default();
    parse_number(section, key, first)
}

fn read_index_map(ini: &Ini, section: &str) -> Result<BTreeMap<usize, usize>, PatternError> {
    let mut map = BTreeMap::new();
    if let Some(entries) = ini.section(section) {
        for (key, value) in entries.entries() {
            map.insert(
                parse_number(section, key, key)?,
                parse_color_index(section, key, value)?,
            );
        }
    }
    Ok(map)
}

fn read_set_map(
    ini: &Ini,
    section: &str,
) -> Result<BTreeMap<usize, BTreeSet<usize>>, PatternError> {
    let mut map = BTreeMap::new();
    if let Some(entries) = ini.section(section) {
        for (key, value) in entries.entries() {
            let values = parse_list(section, key, value)?;
            map.insert(parse_number(section, key, key)?, values.into_iter().collect());
        }
    }
    Ok(map)
}
