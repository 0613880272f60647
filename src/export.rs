//! Text table export of a histogram readout.
//!
//! One row per time bin from -256 to 4095, colon-delimited, three columns
//! per channel. Negative bins have no time value and leave that column blank.
//!
//! ```text
//! bin :Ch01T:ADC0 :ADC1 :Ch02T:ADC0 :ADC1 ...
//! -256:     :    0:    0:     :    0:    0...
//!    0:    3:   17:   12:    0:    0:    0...
//! ```

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use crate::error::Result;
use crate::histogram::{HistogramData, MAIN_BINS, NEGATIVE_BINS};

/// File name the table is written to by default.
pub const DEFAULT_TABLE_FILE: &str = "Histograms.csv";

/// Writes the table for `data` to `out`.
///
/// # Errors
///
/// Returns any error from `out`.
///
/// # Example
///
/// ```
/// use fit_ipbus::{export, HistogramData};
///
/// let mut out = Vec::new();
/// export::write_table(&HistogramData::default(), &mut out).unwrap();
/// let text = String::from_utf8(out).unwrap();
/// assert!(text.starts_with("bin :Ch01T:ADC0 :ADC1 :Ch02T"));
/// assert_eq!(text.lines().count(), 1 + 256 + 4096);
/// ```
pub fn write_table<W: Write>(data: &HistogramData, mut out: W) -> io::Result<()> {
    write!(out, "bin ")?;
    for ch in 1..=data.channels.len() {
        write!(out, ":Ch{:02}T:ADC0 :ADC1 ", ch)?;
    }
    writeln!(out)?;

    for index in (0..NEGATIVE_BINS).rev() {
        write!(out, "{:4}", -(index as i32) - 1)?;
        for ch in &data.channels {
            write!(out, ":     :{:5}:{:5}", ch.n_adc0[index], ch.n_adc1[index])?;
        }
        writeln!(out)?;
    }

    for bin in 0..MAIN_BINS {
        write!(out, "{:4}", bin)?;
        for ch in &data.channels {
            write!(
                out,
                ":{:5}:{:5}:{:5}",
                ch.time[bin], ch.p_adc0[bin], ch.p_adc1[bin]
            )?;
        }
        writeln!(out)?;
    }
    out.flush()
}

/// Writes the table for `data` to the file at `path`, replacing it.
///
/// # Errors
///
/// Returns `FitError::Io` if the file cannot be created or written.
pub fn save_table(data: &HistogramData, path: impl AsRef<Path>) -> Result<()> {
    let file = File::create(path)?;
    write_table(data, BufWriter::new(file))?;
    Ok(())
}
