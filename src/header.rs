//! Header record: a fixed-size ASCII key/value block written once into the
//! ring's header sub-buffer at attach time, and its MJD/UTC stamping helper.
//!
//! Grounded on `dada_header.cpp`'s field list and formats; this is a
//! self-contained stand-in for the `ascii_header` C library, which is an
//! out-of-scope external collaborator.

use crate::error::CaptureError;
use chrono::{Datelike, Timelike, Utc};
use std::collections::BTreeMap;

pub const HEADER_SIZE: usize = 4096;
pub const HDR_VERSION: &str = "1.0";

/// One populated header record, ready to be serialized into the ring's
/// header sub-buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct HeaderRecord {
    pub nant: i32,
    pub pkt_header: i32,
    pub pkt_data: i32,
    pub pkt_nsamp: i32,
    pub pkt_tsamp: f64,
    pub pkt_npol: i32,
    pub pkt_nbit: i32,
    pub bytes_per_second: i64,
    pub file_size: u64,
    pub mjd_start: f64,
    pub utc_start: String,
}

impl HeaderRecord {
    /// Build a record for the current moment, stamping `mjd_start` and
    /// `utc_start` from the system clock.
    pub fn now(
        nant: i32,
        pkt_header: i32,
        pkt_data: i32,
        pkt_nsamp: i32,
        pkt_tsamp: f64,
        pkt_npol: i32,
        pkt_nbit: i32,
        bytes_per_second: i64,
        file_size: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            nant,
            pkt_header,
            pkt_data,
            pkt_nsamp,
            pkt_tsamp,
            pkt_npol,
            pkt_nbit,
            bytes_per_second,
            file_size,
            mjd_start: gregorian_to_mjd(now.year(), now.month() as i32, now.day() as i32)
                + day_fraction(now.hour(), now.minute(), now.second()),
            utc_start: format!(
                "{:04}-{:02}-{:02}-{:02}:{:02}:{:02}",
                now.year(),
                now.month(),
                now.day(),
                now.hour(),
                now.minute(),
                now.second()
            ),
        }
    }

    /// Serialize into a `HEADER_SIZE`-byte buffer, `HDR_VERSION`/`HDR_SIZE`
    /// first, one `KEY  value` line per field, zero-padded to the end.
    pub fn write_to(&self, buf: &mut [u8; HEADER_SIZE]) -> Result<(), CaptureError> {
        let mut text = String::new();
        text.push_str(&format!("HDR_VERSION  {HDR_VERSION}\n"));
        text.push_str(&format!("HDR_SIZE     {HEADER_SIZE}\n"));
        text.push_str(&format!("NANT         {}\n", self.nant));
        text.push_str(&format!("PKT_HEADER   {}\n", self.pkt_header));
        text.push_str(&format!("PKT_DATA     {}\n", self.pkt_data));
        text.push_str(&format!("PKT_NSAMP    {}\n", self.pkt_nsamp));
        text.push_str(&format!("PKT_TSAMP    {}\n", self.pkt_tsamp));
        text.push_str(&format!("PKT_NPOL     {}\n", self.pkt_npol));
        text.push_str(&format!("PKT_NBIT     {}\n", self.pkt_nbit));
        text.push_str(&format!(
            "BYTES_PER_SECOND {}\n",
            self.bytes_per_second
        ));
        text.push_str(&format!("FILE_SIZE    {}\n", self.file_size));
        text.push_str(&format!("MJD_START    {:.15}\n", self.mjd_start));
        text.push_str(&format!("UTC_START    {}\n", self.utc_start));

        if text.len() > HEADER_SIZE {
            return Err(CaptureError::Validation(format!(
                "header record ({} bytes) exceeds {HEADER_SIZE}-byte budget",
                text.len()
            )));
        }

        buf.fill(0);
        buf[..text.len()].copy_from_slice(text.as_bytes());
        Ok(())
    }

    /// Parse a `HEADER_SIZE`-byte buffer back into a record. Missing
    /// required fields are fatal, per spec.
    pub fn read_from(buf: &[u8; HEADER_SIZE]) -> Result<Self, CaptureError> {
        let text = std::str::from_utf8(buf)
            .map_err(|e| CaptureError::Validation(format!("header is not valid utf8: {e}")))?;
        let fields = parse_fields(text);

        let get_i32 = |key: &str| -> Result<i32, CaptureError> { required(&fields, key)?.parse::<i32>().map_err(|_| bad(key)) };
        let get_i64 = |key: &str| -> Result<i64, CaptureError> { required(&fields, key)?.parse::<i64>().map_err(|_| bad(key)) };
        let get_f64 = |key: &str| -> Result<f64, CaptureError> { required(&fields, key)?.parse::<f64>().map_err(|_| bad(key)) };
        let get_u64 = |key: &str| -> Result<u64, CaptureError> { required(&fields, key)?.parse::<u64>().map_err(|_| bad(key)) };

        Ok(HeaderRecord {
            nant: get_i32("NANT")?,
            pkt_header: get_i32("PKT_HEADER")?,
            pkt_data: get_i32("PKT_DATA")?,
            pkt_nsamp: get_i32("PKT_NSAMP")?,
            pkt_tsamp: get_f64("PKT_TSAMP")?,
            pkt_npol: get_i32("PKT_NPOL")?,
            pkt_nbit: get_i32("PKT_NBIT")?,
            bytes_per_second: get_i64("BYTES_PER_SECOND")?,
            file_size: get_u64("FILE_SIZE")?,
            mjd_start: get_f64("MJD_START")?,
            utc_start: required(&fields, "UTC_START")?.to_string(),
        })
    }
}

fn required<'a>(fields: &BTreeMap<&'a str, &'a str>, key: &str) -> Result<&'a str, CaptureError> {
    fields
        .get(key)
        .copied()
        .ok_or_else(|| CaptureError::Validation(format!("header missing required field {key}")))
}

fn bad(key: &str) -> CaptureError {
    CaptureError::Validation(format!("header field {key} has an invalid value"))
}

fn parse_fields(text: &str) -> BTreeMap<&str, &str> {
    let mut fields = BTreeMap::new();
    for line in text.lines() {
        let line = line.trim_end_matches('\0');
        if line.is_empty() {
            continue;
        }
        if let Some((key, rest)) = line.split_once(char::is_whitespace) {
            fields.insert(key, rest.trim());
        }
    }
    fields
}

/// Julian Day Number calculation, then converted to MJD (`JD - 2400000.5`).
fn gregorian_to_mjd(year: i32, month: i32, day: i32) -> f64 {
    let a = (14 - month) / 12;
    let y = year + 4800 - a;
    let m = month + 12 * a - 3;
    let jdn = day + (153 * m + 2) / 5 + 365 * y + y / 4 - y / 100 + y / 400 - 32045;
    (jdn - 2400001) as f64
}

fn day_fraction(hour: u32, minute: u32, second: u32) -> f64 {
    (hour as f64 + minute as f64 / 60.0 + second as f64 / 3600.0) / 24.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> HeaderRecord {
        HeaderRecord {
            nant: 1,
            pkt_header: 8,
            pkt_data: 8128,
            pkt_nsamp: 1024,
            pkt_tsamp: 0.000001024,
            pkt_npol: 2,
            pkt_nbit: 8,
            bytes_per_second: 12_500_000_000,
            file_size: 1_000_000_000_000,
            mjd_start: 60000.123456789012345,
            utc_start: "2026-07-26-12:00:00".to_string(),
        }
    }

    #[test]
    fn test_write_then_read_is_identity() {
        let record = sample();
        let mut buf = [0u8; HEADER_SIZE];
        record.write_to(&mut buf).unwrap();
        let parsed = HeaderRecord::read_from(&buf).unwrap();
        assert_eq!(record, parsed);
    }

    #[test]
    fn test_write_emits_version_and_size_lines() {
        let record = sample();
        let mut buf = [0u8; HEADER_SIZE];
        record.write_to(&mut buf).unwrap();
        let text = std::str::from_utf8(&buf).unwrap();
        assert!(text.starts_with("HDR_VERSION  1.0\nHDR_SIZE     4096\n"));
    }

    #[test]
    fn test_read_missing_field_is_fatal() {
        let mut buf = [0u8; HEADER_SIZE];
        let text = b"HDR_VERSION  1.0\nHDR_SIZE     4096\nNANT  1\n";
        buf[..text.len()].copy_from_slice(text);
        assert!(HeaderRecord::read_from(&buf).is_err());
    }

    #[test]
    fn test_mjd_epoch_known_value() {
        // 1858-11-17 is MJD day 0 by definition.
        assert_eq!(gregorian_to_mjd(1858, 11, 17), 0.0);
    }
}
