use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// The loom's shaft word is 32 bits wide.
pub const MAX_SHAFTS: usize = 32;

/// Largest end, pick or color number accepted from a pattern file.
pub const MAX_PATTERN_INDEX: usize = 100_000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SequenceError {
    #[error("invalid pick number {pick_number}: must be between 0 and {max}")]
    PickOutOfRange { pick_number: i64, max: usize },
    #[error("no pick is active")]
    NoActivePick,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatternError {
    #[error("line {line}: {message}")]
    Syntax { line: usize, message: String },
    #[error("missing [{0}] section")]
    MissingSection(&'static str),
    #[error("missing {key} in [{section}]")]
    MissingKey {
        section: &'static str,
        key: &'static str,
    },
    #[error("invalid value {value:?} for {key} in [{section}]")]
    InvalidValue {
        section: String,
        key: String,
        value: String,
    },
    #[error("{count} shafts exceeds the maximum of {max}")]
    TooManyShafts { count: usize, max: usize },
    #[error("pick {pick} raises shaft {shaft} but the pattern has {shafts} shafts")]
    ShaftOutOfRange {
        pick: usize,
        shaft: usize,
        shafts: usize,
    },
    #[error("[{section}] index {index} exceeds the limit of {max}")]
    IndexTooLarge {
        section: &'static str,
        index: usize,
        max: usize,
    },
    #[error("invalid color range {min}..{max}")]
    InvalidColorRange { min: u32, max: u32 },
}

/// Format-neutral pattern description, as produced by a pattern-format reader.
///
/// Every map is keyed by a 1-based number (end, pick, treadle, color) and every
/// shaft, treadle and color value is 1-based as well; 0 means "none".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternData {
    pub num_shafts: usize,
    pub rising_shed: bool,
    pub color_range: (u32, u32),
    pub color_table: BTreeMap<usize, [u32; 3]>,
    pub warp_threads: usize,
    pub weft_threads: usize,
    pub warp_color: Option<usize>,
    pub weft_color: Option<usize>,
    pub warp_colors: BTreeMap<usize, usize>,
    pub weft_colors: BTreeMap<usize, usize>,
    pub threading: BTreeMap<usize, BTreeSet<usize>>,
    pub tieup: BTreeMap<usize, BTreeSet<usize>>,
    pub treadling: BTreeMap<usize, BTreeSet<usize>>,
    pub liftplan: BTreeMap<usize, BTreeSet<usize>>,
}

impl Default for PatternData {
    fn default() -> Self {
        Self {
            num_shafts: 0,
            rising_shed: true,
            color_range: (0, 255),
            color_table: BTreeMap::new(),
            warp_threads: 0,
            weft_threads: 0,
            warp_color: None,
            weft_color: None,
            warp_colors: BTreeMap::new(),
            weft_colors: BTreeMap::new(),
            threading: BTreeMap::new(),
            tieup: BTreeMap::new(),
            treadling: BTreeMap::new(),
            liftplan: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Pick {
    pub are_shafts_up: Vec<bool>,
    /// Index into the pattern's color table.
    pub color: usize,
}

impl Pick {
    /// Bit i set means shaft i is raised.
    pub fn shaft_word(&self) -> u32 {
        self.are_shafts_up
            .iter()
            .take(MAX_SHAFTS)
            .enumerate()
            .filter(|(_, is_up)| **is_up)
            .fold(0u32, |word, (shaft, _)| word | (1 << shaft))
    }
}

/// A weaving pattern reduced to what the loom and the client need, plus the
/// weaving position within it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReducedPattern {
    pub name: String,
    pub color_table: Vec<String>,
    pub warp_colors: Vec<usize>,
    /// 0-based shaft per end; -1 for an unthreaded end.
    pub threading: Vec<i32>,
    pub picks: Vec<Pick>,
    /// 0 is the rest position; k > 0 means `picks[k - 1]` is active.
    pub pick_number: usize,
    pub repeat_number: i64,
}

impl ReducedPattern {
    pub fn from_pattern_data(name: &str, data: &PatternData) -> Result<Self, PatternError> {
        if data.num_shafts > MAX_SHAFTS {
            return Err(PatternError::TooManyShafts {
                count: data.num_shafts,
                max: MAX_SHAFTS,
            });
        }

        check_index("WARP", data.warp_threads)?;
        check_index("WEFT", data.weft_threads)?;
        check_index("COLOR TABLE", last_key(&data.color_table))?;
        check_index("THREADING", last_key(&data.threading))?;
        check_index("TREADLING", last_key(&data.treadling))?;
        check_index("LIFTPLAN", last_key(&data.liftplan))?;

        let color_table = reduce_color_table(data)?;

        let warp_ends = data.warp_threads.max(last_key(&data.threading));
        let warp_colors = (1..=warp_ends)
            .map(|end| {
                data.warp_colors
                    .get(&end)
                    .copied()
                    .or(data.warp_color)
                    .unwrap_or(1)
                    .saturating_sub(1)
            })
            .collect();
        let threading = (1..=warp_ends)
            .map(|end| {
                data.threading
                    .get(&end)
                    .and_then(|shafts| shafts.iter().copied().filter(|s| *s > 0).max())
                    .and_then(|shaft| i32::try_from(shaft - 1).ok())
                    .unwrap_or(-1)
            })
            .collect();

        let use_liftplan = !data.liftplan.is_empty();
        let num_picks = if use_liftplan {
            last_key(&data.liftplan)
        } else {
            last_key(&data.treadling)
        };

        let mut picks = Vec::with_capacity(num_picks);
        for pick_number in 1..=num_picks {
            let raised = if use_liftplan {
                data.liftplan.get(&pick_number).cloned().unwrap_or_default()
            } else {
                shafts_from_treadles(data, pick_number)
            };
            let mut are_shafts_up = vec![!data.rising_shed; data.num_shafts];
            for shaft in raised.into_iter().filter(|s| *s > 0) {
                if shaft > data.num_shafts {
                    return Err(PatternError::ShaftOutOfRange {
                        pick: pick_number,
                        shaft,
                        shafts: data.num_shafts,
                    });
                }
                are_shafts_up[shaft - 1] = data.rising_shed;
            }
            let color = data
                .weft_colors
                .get(&pick_number)
                .copied()
                .or(data.weft_color)
                .unwrap_or(1)
                .saturating_sub(1);
            picks.push(Pick {
                are_shafts_up,
                color,
            });
        }

        Ok(Self {
            name: name.to_string(),
            color_table,
            warp_colors,
            threading,
            picks,
            pick_number: 0,
            repeat_number: 1,
        })
    }

    pub fn pick_count(&self) -> usize {
        self.picks.len()
    }

    /// Step one pick in the weave direction, wrapping into the next or
    /// previous repeat. Returns the new pick number; 0 means there is no pick
    /// to command (a repeat boundary, or the backward floor at repeat 0).
    ///
    /// Only repeat 0 is a floor. A negative repeat left by `jump_to` keeps
    /// unwinding.
    pub fn advance(&mut self, forward: bool) -> usize {
        let count = self.pick_count();
        if forward {
            if self.pick_number >= count {
                self.pick_number = 0;
                self.repeat_number += 1;
            } else {
                self.pick_number += 1;
            }
        } else if self.pick_number > 0 {
            self.pick_number -= 1;
        } else if self.repeat_number != 0 {
            self.pick_number = count;
            self.repeat_number -= 1;
        }
        self.pick_number
    }

    /// Jump to an absolute position. The repeat number is stored as given,
    /// negative values included.
    pub fn jump_to(&mut self, pick_number: i64, repeat_number: i64) -> Result<(), SequenceError> {
        let max = self.pick_count();
        let pick = usize::try_from(pick_number)
            .ok()
            .filter(|pick| *pick <= max)
            .ok_or(SequenceError::PickOutOfRange { pick_number, max })?;
        self.pick_number = pick;
        self.repeat_number = repeat_number;
        Ok(())
    }

    pub fn current_pick(&self) -> Result<&Pick, SequenceError> {
        if self.pick_number == 0 {
            return Err(SequenceError::NoActivePick);
        }
        self.picks
            .get(self.pick_number - 1)
            .ok_or(SequenceError::NoActivePick)
    }
}

fn last_key<V>(map: &BTreeMap<usize, V>) -> usize {
    map.keys().next_back().copied().unwrap_or(0)
}

fn check_index(section: &'static str, index: usize) -> Result<(), PatternError> {
    if index > MAX_PATTERN_INDEX {
        return Err(PatternError::IndexTooLarge {
            section,
            index,
            max: MAX_PATTERN_INDEX,
        });
    }
    Ok(())
}

fn shafts_from_treadles(data: &PatternData, pick_number: usize) -> BTreeSet<usize> {
    let mut shafts = BTreeSet::new();
    if let Some(treadles) = data.treadling.get(&pick_number) {
        for treadle in treadles.iter().filter(|t| **t > 0) {
            if let Some(tied) = data.tieup.get(treadle) {
                shafts.extend(tied.iter().copied());
            }
        }
    }
    shafts
}

fn reduce_color_table(data: &PatternData) -> Result<Vec<String>, PatternError> {
    let (min, max) = data.color_range;
    if max <= min {
        return Err(PatternError::InvalidColorRange { min, max });
    }
    let span = u64::from(max - min);
    let count = last_key(&data.color_table);
    Ok((1..=count)
        .map(|index| {
            let rgb = data.color_table.get(&index).copied().unwrap_or([min; 3]);
            let [r, g, b] = rgb.map(|component| {
                let scaled = u64::from(component.saturating_sub(min)) * 255 / span;
                scaled.min(255) as u8
            });
            format!("#{r:02x}{g:02x}{b:02x}")
        })
        .collect())
}
