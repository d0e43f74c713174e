//! Cipher transformation strings of the form `AES/<mode>/<padding>`.

use std::{fmt, str::FromStr};

use aes::cipher::block_padding::{Pkcs7, RawPadding, UnpadError};

use crate::error::{ProbeError, ProbeResult};

pub const AES_BLOCK_SIZE: usize = 16;

/// IV length used for GCM when the caller lets the provider pick one.
pub const GCM_DEFAULT_IV_LEN: usize = 12;

/// The block-cipher configurations exercised by the probe, in order.
pub const AES_BLOCK_CIPHERS: [&str; 5] = [
    "AES/CBC/NoPadding",
    "AES/CBC/PKCS5Padding",
    "AES/ECB/NoPadding",
    "AES/ECB/PKCS5Padding",
    "AES/CTR/NoPadding",
];

pub const AES_GCM: &str = "AES/GCM/NoPadding";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Encrypt,
    Decrypt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    Ecb,
    Cbc,
    Ctr,
    Gcm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Padding {
    None,
    Pkcs5,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Transformation {
    pub mode: Mode,
    pub padding: Padding,
}

impl Transformation {
    pub const fn new(mode: Mode, padding: Padding) -> Self {
        Self { mode, padding }
    }

    pub fn block_size(&self) -> usize {
        AES_BLOCK_SIZE
    }

    /// IV length generated for encryption when none is supplied.
    pub fn default_iv_len(&self) -> Option<usize> {
        match self.mode {
            Mode::Ecb => None,
            Mode::Cbc | Mode::Ctr => Some(AES_BLOCK_SIZE),
            Mode::Gcm => Some(GCM_DEFAULT_IV_LEN),
        }
    }

    pub fn is_aead(&self) -> bool {
        matches!(self.mode, Mode::Gcm)
    }

    /// Rejects input lengths the transformation cannot process.
    pub fn check_input_len(&self, direction: Direction, len: usize) -> ProbeResult<()> {
        let aligned = len % AES_BLOCK_SIZE == 0;
        match (self.mode, self.padding, direction) {
            (Mode::Ecb | Mode::Cbc, Padding::None, _) if !aligned => {
                Err(ProbeError::IllegalBlockSize(format!(
                    "{self}: input length {len} is not a multiple of {AES_BLOCK_SIZE}"
                )))
            }
            (Mode::Ecb | Mode::Cbc, Padding::Pkcs5, Direction::Decrypt) if !aligned || len == 0 => {
                Err(ProbeError::IllegalBlockSize(format!(
                    "{self}: padded ciphertext length {len} is not a positive multiple of {AES_BLOCK_SIZE}"
                )))
            }
            _ => Ok(()),
        }
    }
}

/// Appends PKCS#5 padding up to the next block boundary.
pub(crate) fn pkcs5_pad(data: &[u8]) -> Vec<u8> {
    let tail = data.len() % AES_BLOCK_SIZE;
    let last = data.len() - tail;
    let mut padded = Vec::with_capacity(last + AES_BLOCK_SIZE);
    padded.extend_from_slice(data);
    padded.resize(last + AES_BLOCK_SIZE, 0);
    Pkcs7::raw_pad(&mut padded[last..], tail);
    padded
}

/// Strips PKCS#5 padding from the final block.
pub(crate) fn pkcs5_unpad(mut data: Vec<u8>) -> ProbeResult<Vec<u8>> {
    if data.is_empty() || data.len() % AES_BLOCK_SIZE != 0 {
        return Err(ProbeError::BadPadding);
    }
    let last = data.len() - AES_BLOCK_SIZE;
    let kept = Pkcs7::raw_unpad(&data[last..])
        .map_err(|_: UnpadError| ProbeError::BadPadding)?
        .len();
    data.truncate(last + kept);
    Ok(data)
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Mode::Ecb => "ECB",
            Mode::Cbc => "CBC",
            Mode::Ctr => "CTR",
            Mode::Gcm => "GCM",
        })
    }
}

impl fmt::Display for Padding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Padding::None => "NoPadding",
            Padding::Pkcs5 => "PKCS5Padding",
        })
    }
}

impl fmt::Display for Transformation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AES/{}/{}", self.mode, self.padding)
    }
}

impl FromStr for Mode {
    type Err = ProbeError;

    fn from_str(s: &str) -> ProbeResult<Self> {
        match s.to_ascii_uppercase().as_str() {
            "ECB" => Ok(Mode::Ecb),
            "CBC" => Ok(Mode::Cbc),
            "CTR" => Ok(Mode::Ctr),
            "GCM" => Ok(Mode::Gcm),
            _ => Err(ProbeError::no_such_algorithm(format!("unsupported mode {s}"))),
        }
    }
}

impl FromStr for Padding {
    type Err = ProbeError;

    fn from_str(s: &str) -> ProbeResult<Self> {
        match s.to_ascii_uppercase().as_str() {
            "NOPADDING" => Ok(Padding::None),
            "PKCS5PADDING" | "PKCS7PADDING" => Ok(Padding::Pkcs5),
            _ => Err(ProbeError::no_such_algorithm(format!("unsupported padding {s}"))),
        }
    }
}

impl FromStr for Transformation {
    type Err = ProbeError;

    fn from_str(s: &str) -> ProbeResult<Self> {
        let parts: Vec<&str> = s.trim().split('/').collect();
        let (algorithm, mode, padding) = match parts.as_slice() {
            [algorithm] => (*algorithm, Mode::Ecb, Padding::Pkcs5),
            [algorithm, mode, padding] => (*algorithm, mode.parse()?, padding.parse()?),
            _ => {
                return Err(ProbeError::no_such_algorithm(format!(
                    "malformed transformation {s}"
                )))
            }
        };
        if !algorithm.eq_ignore_ascii_case("AES") {
            return Err(ProbeError::no_such_algorithm(format!(
                "unsupported algorithm {algorithm}"
            )));
        }
        if matches!(mode, Mode::Ctr | Mode::Gcm) && padding != Padding::None {
            return Err(ProbeError::no_such_algorithm(format!(
                "{mode} mode must be used with NoPadding"
            )));
        }
        Ok(Transformation::new(mode, padding))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_transformations_round_trip_through_display() {
        for text in AES_BLOCK_CIPHERS.iter().chain(std::iter::once(&AES_GCM)) {
            let parsed: Transformation = text.parse().unwrap();
            assert_eq!(parsed.to_string(), *text);
        }
    }

    #[test]
    fn parsing_is_case_insensitive_with_defaults() {
        let t: Transformation = "aes/cbc/pkcs7padding".parse().unwrap();
        assert_eq!(t, Transformation::new(Mode::Cbc, Padding::Pkcs5));
        let bare: Transformation = "AES".parse().unwrap();
        assert_eq!(bare, Transformation::new(Mode::Ecb, Padding::Pkcs5));
    }

    #[test]
    fn rejects_unsupported_combinations() {
        assert!("AES/GCM/PKCS5Padding".parse::<Transformation>().is_err());
        assert!("AES/CTR/PKCS5Padding".parse::<Transformation>().is_err());
        assert!("DES/CBC/NoPadding".parse::<Transformation>().is_err());
        assert!("AES/OFB/NoPadding".parse::<Transformation>().is_err());
        assert!("AES/CBC".parse::<Transformation>().is_err());
    }

    #[test]
    fn input_length_rules() {
        let cbc: Transformation = "AES/CBC/NoPadding".parse().unwrap();
        assert!(cbc.check_input_len(Direction::Encrypt, 32).is_ok());
        assert!(matches!(
            cbc.check_input_len(Direction::Encrypt, 13),
            Err(ProbeError::IllegalBlockSize(_))
        ));
        let padded: Transformation = "AES/ECB/PKCS5Padding".parse().unwrap();
        assert!(padded.check_input_len(Direction::Encrypt, 13).is_ok());
        assert!(padded.check_input_len(Direction::Decrypt, 0).is_err());
        let ctr: Transformation = "AES/CTR/NoPadding".parse().unwrap();
        assert!(ctr.check_input_len(Direction::Decrypt, 5).is_ok());
    }

    #[test]
    fn pkcs5_padding() {
        let padded = pkcs5_pad(b"Hello, world!!!!");
        assert_eq!(padded.len(), 32);
        assert!(padded[16..].iter().all(|b| *b == 16));
        assert_eq!(pkcs5_unpad(padded).unwrap(), b"Hello, world!!!!");

        assert_eq!(pkcs5_pad(b"abc").len(), 16);
        let mut broken = pkcs5_pad(b"abc");
        broken[10] = 0;
        assert!(matches!(pkcs5_unpad(broken), Err(ProbeError::BadPadding)));
        assert!(pkcs5_unpad(vec![0u8; 16]).is_err());
        assert!(pkcs5_unpad(Vec::new()).is_err());
        assert!(matches!(
            pkcs5_unpad(vec![17u8; 16]),
            Err(ProbeError::BadPadding)
        ));
        assert!(pkcs5_unpad(vec![1u8; 15]).is_err());

        let two_blocks = pkcs5_pad(&[7u8; 20]);
        assert_eq!(two_blocks.len(), 32);
        assert_eq!(&two_blocks[20..], &[12u8; 12]);
        assert_eq!(pkcs5_unpad(two_blocks).unwrap(), vec![7u8; 20]);
    }

    #[test]
    fn default_iv_lengths() {
        let ecb: Transformation = "AES/ECB/NoPadding".parse().unwrap();
        assert_eq!(ecb.default_iv_len(), None);
        let ctr: Transformation = "AES/CTR/NoPadding".parse().unwrap();
        assert_eq!(ctr.default_iv_len(), Some(AES_BLOCK_SIZE));
        let gcm: Transformation = AES_GCM.parse().unwrap();
        assert_eq!(gcm.default_iv_len(), Some(12));
    }
}
