//! Histogram memory layout and the decoded histogram buffer.
//!
//! Each of the [`CHANNELS`] channels occupies [`CHANNEL_WORDS`] consecutive
//! words of board memory:
//!
//! | Offset | Length | Content |
//! |--------|--------|---------|
//! | 0 | 256 | `nADC0`, negative-time region |
//! | 256 | 256 | `nADC1`, negative-time region |
//! | 512 | 4096 | `time`, main region |
//! | 4608 | 4096 | `pADC0`, main region |
//! | 8704 | 4096 | `pADC1`, main region |
//!
//! Index `i` of the negative region holds time bin `-(i + 1)`.

/// Number of channels per link.
pub const CHANNELS: usize = 12;

/// Samples in the negative-time region.
pub const NEGATIVE_BINS: usize = 256;

/// Samples in the main region.
pub const MAIN_BINS: usize = 4096;

/// Words occupied by one channel.
pub const CHANNEL_WORDS: usize = 2 * NEGATIVE_BINS + 3 * MAIN_BINS;

/// Words in a complete readout of all channels.
pub const HISTOGRAM_WORDS: usize = CHANNELS * CHANNEL_WORDS;

/// Histograms of one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelHistogram {
    /// Negative-region counters, ADC 0.
    pub n_adc0: Vec<u32>,
    /// Negative-region counters, ADC 1.
    pub n_adc1: Vec<u32>,
    /// Main-region time values.
    pub time: Vec<u32>,
    /// Main-region counters, ADC 0.
    pub p_adc0: Vec<u32>,
    /// Main-region counters, ADC 1.
    pub p_adc1: Vec<u32>,
}

impl Default for ChannelHistogram {
    fn default() -> Self {
        Self {
            n_adc0: vec![0; NEGATIVE_BINS],
            n_adc1: vec![0; NEGATIVE_BINS],
            time: vec![0; MAIN_BINS],
            p_adc0: vec![0; MAIN_BINS],
            p_adc1: vec![0; MAIN_BINS],
        }
    }
}

impl ChannelHistogram {
    /// Decodes one channel from exactly [`CHANNEL_WORDS`] words.
    pub fn from_words(words: &[u32]) -> Option<Self> {
        if words.len() != CHANNEL_WORDS {
            return None;
        }
        let (n_adc0, rest) = words.split_at(NEGATIVE_BINS);
        let (n_adc1, rest) = rest.split_at(NEGATIVE_BINS);
        let (time, rest) = rest.split_at(MAIN_BINS);
        let (p_adc0, p_adc1) = rest.split_at(MAIN_BINS);
        Some(Self {
            n_adc0: n_adc0.to_vec(),
            n_adc1: n_adc1.to_vec(),
            time: time.to_vec(),
            p_adc0: p_adc0.to_vec(),
            p_adc1: p_adc1.to_vec(),
        })
    }

    /// `(nADC0, nADC1)` of negative time bin `bin` (-256..=-1).
    pub fn negative(&self, bin: i32) -> Option<(u32, u32)> {
        if !(-(NEGATIVE_BINS as i32)..0).contains(&bin) {
            return None;
        }
        let index = (-bin - 1) as usize;
        Some((self.n_adc0[index], self.n_adc1[index]))
    }

    /// `(time, pADC0, pADC1)` of main bin `bin` (0..4096).
    pub fn main(&self, bin: usize) -> Option<(u32, u32, u32)> {
        Some((
            *self.time.get(bin)?,
            *self.p_adc0.get(bin)?,
            *self.p_adc1.get(bin)?,
        ))
    }
}

/// All channels of one link, replaced wholesale by each complete readout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistogramData {
    /// Channels 1..=12, in order.
    pub channels: Vec<ChannelHistogram>,
}

impl Default for HistogramData {
    fn default() -> Self {
        Self {
            channels: vec![ChannelHistogram::default(); CHANNELS],
        }
    }
}

impl HistogramData {
    /// Decodes a complete readout of [`HISTOGRAM_WORDS`] words.
    ///
    /// Returns `None` for any other length.
    ///
    /// ```
    /// use fit_ipbus::{HistogramData, HISTOGRAM_WORDS};
    ///
    /// let words: Vec<u32> = (0..HISTOGRAM_WORDS as u32).collect();
    /// let data = HistogramData::from_words(&words).unwrap();
    /// assert_eq!(data.channels.len(), 12);
    /// assert_eq!(data.channels[0].n_adc0[0], 0);
    /// assert_eq!(data.channels[1].n_adc0[0], 12800);
    /// assert!(HistogramData::from_words(&words[1..]).is_none());
    /// ```
    pub fn from_words(words: &[u32]) -> Option<Self> {
        if words.len() != HISTOGRAM_WORDS {
            return None;
        }
        let channels = words
            .chunks_exact(CHANNEL_WORDS)
            .map(ChannelHistogram::from_words)
            .collect::<Option<Vec<_>>>()?;
        Some(Self { channels })
    }
}
