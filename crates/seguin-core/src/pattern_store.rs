use crate::pattern::ReducedPattern;

/// Maximum number of patterns kept in memory.
pub const MAX_PATTERNS: usize = 20;

/// Uploaded patterns, oldest first.
///
/// The pattern currently being woven is never evicted or cleared; callers pass
/// its name in so the store stays free of session state.
#[derive(Debug, Clone, Default)]
pub struct PatternStore {
    patterns: Vec<ReducedPattern>,
}

impl PatternStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<&ReducedPattern> {
        self.patterns.iter().find(|pattern| pattern.name == name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut ReducedPattern> {
        self.patterns.iter_mut().find(|pattern| pattern.name == name)
    }

    /// Names in insertion order, oldest first.
    pub fn names(&self) -> Vec<String> {
        self.patterns
            .iter()
            .map(|pattern| pattern.name.clone())
            .collect()
    }

    /// Store a pattern as the most recent entry, replacing any pattern of the
    /// same name, then evict entries older than the newest [`MAX_PATTERNS`].
    /// The current pattern is kept even when it is that old, so the store
    /// can hold one extra entry. Returns the names of evicted patterns.
    pub fn add(&mut self, pattern: ReducedPattern, current: Option<&str>) -> Vec<String> {
        if let Some(index) = self.position(&pattern.name) {
            self.patterns.remove(index);
        }
        self.patterns.push(pattern);

        let overflow = self.patterns.len().saturating_sub(MAX_PATTERNS);
        let mut evicted = Vec::new();
        let mut index = 0;
        self.patterns.retain(|pattern| {
            let too_old = index < overflow;
            index += 1;
            if too_old && Some(pattern.name.as_str()) != current {
                evicted.push(pattern.name.clone());
                false
            } else {
                true
            }
        });
        evicted
    }

    /// Drop every pattern except the current one.
    pub fn clear_except(&mut self, current: Option<&str>) {
        self.patterns
            .retain(|pattern| Some(pattern.name.as_str()) == current);
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.patterns.iter().position(|pattern| pattern.name == name)
    }
}
