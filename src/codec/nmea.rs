// NMEA sentence framing and GGA fix parsing

use crate::constants::MAX_SENTENCE_LEN;
use crate::error::{Error, Result};
use serde::Serialize;

/// RTK fix status derived from the GGA fix-quality code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FixStatus {
    None,
    Float,
    Fixed,
}

impl FixStatus {
    /// Map a GGA quality code: 4 = RTK fixed, 5 = RTK float, anything else
    /// (including ordinary GPS/DGPS codes 0-3) carries no RTK lock.
    pub fn from_quality(code: u8) -> Self {
        match code {
            4 => FixStatus::Fixed,
            5 => FixStatus::Float,
            _ => FixStatus::None,
        }
    }
}

/// A position fix decoded from a GGA sentence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GgaFix {
    /// Latitude in decimal degrees.
    pub latitude: f64,
    /// Longitude in decimal degrees.
    pub longitude: f64,
    pub fix: FixStatus,
}

/// Accumulates raw bytes into complete NMEA sentences.
///
/// A sentence starts at `$` and ends at CRLF. Bytes outside a sentence are
/// discarded; invalid UTF-8 inside one is replaced rather than rejected.
#[derive(Debug, Default)]
pub struct SentenceAccumulator {
    buf: Vec<u8>,
    in_sentence: bool,
}

impl SentenceAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes, returning every complete sentence (terminator
    /// stripped) finished by this chunk.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut sentences = Vec::new();
        for &b in bytes {
            if b == b'$' {
                // A new start marker always restarts the sentence
                self.buf.clear();
                self.buf.push(b);
                self.in_sentence = true;
                continue;
            }
            if !self.in_sentence {
                continue;
            }
            self.buf.push(b);
            if self.buf.ends_with(b"\r\n") {
                self.buf.truncate(self.buf.len() - 2);
                sentences.push(String::from_utf8_lossy(&self.buf).into_owned());
                self.buf.clear();
                self.in_sentence = false;
            } else if self.buf.len() > MAX_SENTENCE_LEN {
                // Runaway sentence with no terminator: drop and resync
                self.buf.clear();
                self.in_sentence = false;
            }
        }
        sentences
    }
}

/// True for the sentence types that carry a GPS fix we interpret.
pub fn is_gga(sentence: &str) -> bool {
    sentence.starts_with("$GPGGA") || sentence.starts_with("$GNGGA")
}

/// Parse a GGA sentence into a position fix.
///
/// Field 2 is latitude, field 4 longitude (both DDMM.MMMM), field 6 the
/// one-digit fix quality. The N/S and E/W indicator fields are not applied;
/// positions assume the northern/eastern hemispheres.
pub fn parse_gga(sentence: &str) -> Result<GgaFix> {
    if !is_gga(sentence) {
        return Err(Error::NotGga(sentence.to_string()));
    }

    let fields: Vec<&str> = sentence.split(',').collect();
    if fields.len() < 7 {
        return Err(Error::TruncatedSentence(fields.len()));
    }

    let latitude = nmea_to_decimal(fields[2])?;
    let longitude = nmea_to_decimal(fields[4])?;
    let quality: u8 = fields[6]
        .trim()
        .parse()
        .map_err(|_| Error::BadFixQuality(fields[6].to_string()))?;

    Ok(GgaFix {
        latitude,
        longitude,
        fix: FixStatus::from_quality(quality),
    })
}

/// Convert a DDMM.MMMM coordinate field to decimal degrees.
fn nmea_to_decimal(raw: &str) -> Result<f64> {
    let value: f64 = raw
        .parse()
        .map_err(|_| Error::BadCoordinate(raw.to_string()))?;
    let degrees = (value / 100.0).floor();
    let minutes = value - degrees * 100.0;
    Ok(degrees + minutes / 60.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const GGA: &str = "$GPGGA,123519,3737.0079,N,12701.6446,E,4,12,0.8,45.0,M,19.6,M,,*72";

    #[test]
    fn test_parse_gga_reference_sentence() {
        let fix = parse_gga(GGA).unwrap();
        assert!((fix.latitude - 37.616798).abs() < 1e-6);
        assert!((fix.longitude - 127.027410).abs() < 1e-6);
        assert_eq!(fix.fix, FixStatus::Fixed);
    }

    #[test]
    fn test_quality_boundary_codes() {
        for (code, expected) in [
            (3u8, FixStatus::None),
            (4, FixStatus::Fixed),
            (5, FixStatus::Float),
            (6, FixStatus::None),
        ] {
            let sentence = format!(
                "$GPGGA,123519,3737.0079,N,12701.6446,E,{},12,0.8,45.0,M,19.6,M,,*72",
                code
            );
            assert_eq!(parse_gga(&sentence).unwrap().fix, expected, "code {}", code);
        }
        // Ordinary GPS codes never imply an RTK lock
        for code in 0u8..=2 {
            assert_eq!(FixStatus::from_quality(code), FixStatus::None);
        }
    }

    #[test]
    fn test_gngga_accepted() {
        let sentence = "$GNGGA,123519,3737.0079,N,12701.6446,E,5,12,0.8,45.0,M,19.6,M,,*72";
        assert_eq!(parse_gga(sentence).unwrap().fix, FixStatus::Float);
    }

    #[test]
    fn test_non_gga_rejected() {
        let sentence = "$GPRMC,123519,A,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W*6A";
        assert!(!is_gga(sentence));
        assert!(matches!(parse_gga(sentence), Err(Error::NotGga(_))));
    }

    #[test]
    fn test_too_few_fields() {
        assert!(matches!(
            parse_gga("$GPGGA,123519,3737.0079"),
            Err(Error::TruncatedSentence(3))
        ));
    }

    #[test]
    fn test_non_numeric_fields() {
        let bad_lat = "$GPGGA,123519,oops,N,12701.6446,E,4,12";
        assert!(matches!(parse_gga(bad_lat), Err(Error::BadCoordinate(_))));

        let bad_quality = "$GPGGA,123519,3737.0079,N,12701.6446,E,x,12";
        assert!(matches!(parse_gga(bad_quality), Err(Error::BadFixQuality(_))));
    }

    #[test]
    fn test_accumulator_single_sentence() {
        let mut acc = SentenceAccumulator::new();
        let out = acc.feed(b"$GPGGA,1,2,3\r\n");
        assert_eq!(out, vec!["$GPGGA,1,2,3".to_string()]);
    }

    #[test]
    fn test_accumulator_byte_by_byte() {
        let mut acc = SentenceAccumulator::new();
        let mut out = Vec::new();
        for b in b"$GPGGA,1,2,3\r\n" {
            out.extend(acc.feed(&[*b]));
        }
        assert_eq!(out, vec!["$GPGGA,1,2,3".to_string()]);
    }

    #[test]
    fn test_accumulator_skips_leading_garbage() {
        let mut acc = SentenceAccumulator::new();
        let out = acc.feed(b"noise\r\n$GPGGA,1\r\n");
        assert_eq!(out, vec!["$GPGGA,1".to_string()]);
    }

    #[test]
    fn test_accumulator_two_sentences_one_chunk() {
        let mut acc = SentenceAccumulator::new();
        let out = acc.feed(b"$GPGGA,1\r\n$GPRMC,2\r\n");
        assert_eq!(out, vec!["$GPGGA,1".to_string(), "$GPRMC,2".to_string()]);
    }

    #[test]
    fn test_accumulator_restart_on_nested_start() {
        let mut acc = SentenceAccumulator::new();
        let out = acc.feed(b"$GPGGA,half$GPRMC,2\r\n");
        assert_eq!(out, vec!["$GPRMC,2".to_string()]);
    }

    #[test]
    fn test_accumulator_drops_runaway_sentence() {
        let mut acc = SentenceAccumulator::new();
        let mut junk = vec![b'$'];
        junk.extend(std::iter::repeat(b'A').take(MAX_SENTENCE_LEN + 8));
        assert!(acc.feed(&junk).is_empty());
        let out = acc.feed(b"$GPGGA,1\r\n");
        assert_eq!(out, vec!["$GPGGA,1".to_string()]);
    }

    #[test]
    fn test_accumulator_lossy_utf8() {
        let mut acc = SentenceAccumulator::new();
        let out = acc.feed(b"$GPTXT,\xff\r\n");
        assert_eq!(out.len(), 1);
        assert!(out[0].starts_with("$GPTXT,"));
    }
}
