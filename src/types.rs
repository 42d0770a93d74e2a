pub const NUM_BANDS: usize = 30;
pub const MAX_LEVEL: u8 = 12;

/// Banded spectrum levels in `0..=MAX_LEVEL`, lowest frequency first.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SpectrumBands {
    levels: [u8; NUM_BANDS],
}

impl SpectrumBands {
    pub fn from_levels(levels: [u8; NUM_BANDS]) -> SpectrumBands {
        SpectrumBands { levels }
    }

    pub fn levels(&self) -> &[u8; NUM_BANDS] {
        &self.levels
    }
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Deserialize)]
pub struct NowPlaying {
    pub artist: String,
    pub title: String,
}

impl NowPlaying {
    pub fn new(artist: &str, title: &str) -> NowPlaying {
        NowPlaying {
            artist: artist.to_string(),
            title: title.to_string(),
        }
    }

    pub fn line(&self) -> String {
        format!("{} - {}", self.artist, self.title)
    }
}

impl Default for NowPlaying {
    fn default() -> Self {
        NowPlaying::new("Loading...", "Initializing...")
    }
}
