/// Immutable, ordered list of stream locators.
///
/// External callers speak in 1-based station numbers; everything inside the
/// daemon works with 0-based positions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StationList {
    locators: Vec<String>,
}

impl StationList {
    pub fn new(locators: Vec<String>) -> Self {
        Self { locators }
    }

    pub fn len(&self) -> usize {
        self.locators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locators.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.locators.get(index).map(String::as_str)
    }

    /// Maps a 1-based station number to a position, falling back to the
    /// first station when the number is out of range.
    pub fn resolve(&self, number: usize) -> usize {
        if number == 0 || number > self.locators.len() {
            0
        } else {
            number - 1
        }
    }

    pub fn next_of(&self, index: usize) -> usize {
        if self.locators.is_empty() {
            return 0;
        }
        (index + 1) % self.locators.len()
    }

    pub fn prev_of(&self, index: usize) -> usize {
        if self.locators.is_empty() {
            return 0;
        }
        if index == 0 || index >= self.locators.len() {
            self.locators.len() - 1
        } else {
            index - 1
        }
    }

    pub fn number_of(index: usize) -> usize {
        index + 1
    }
}
