//! Capture flag generation
//!
//! A flag is a fixed-length token `FIRE{<core>}` where the core is drawn from
//! an alphabet without look-alike characters. Cores are produced by slicing
//! 6-bit indices out of one 64-bit draw at a time, so ten characters usually
//! cost a single call into the OS random source.

use crate::error::{Error, Result};
use rand::rngs::OsRng;
use rand::{CryptoRng, Rng, RngCore};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Flag prefix
pub const FLAG_PREFIX: &str = "FIRE";

/// Number of random characters in a flag
pub const CORE_LEN: usize = 10;

/// Total flag length: prefix, braces and core
pub const FLAG_LEN: usize = FLAG_PREFIX.len() + 2 + CORE_LEN;

/// Characters a flag core is drawn from (no 0/O/o, 1/I/l)
pub const ALPHABET: &[u8] = b"abcdefghijkmnpqrstuvwxyzABCDEFGHJKLMNPQRSTUVWXYZ23456789";

const INDEX_BITS: u32 = 6;
const INDEX_MASK: u64 = (1 << INDEX_BITS) - 1;
const INDICES_PER_DRAW: u32 = 63 / INDEX_BITS;

/// A generated capture flag
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Flag([u8; FLAG_LEN]);

impl Flag {
    /// Generate a flag from the OS random source
    pub fn generate() -> Self {
        Self::generate_with(&mut OsRng)
    }

    /// Generate a flag from a caller-supplied cryptographic random source
    pub fn generate_with<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self::from_core(random_core(rng))
    }

    fn from_core(core: [u8; CORE_LEN]) -> Self {
        let mut buf = [0u8; FLAG_LEN];
        let prefix = FLAG_PREFIX.as_bytes();
        buf[..prefix.len()].copy_from_slice(prefix);
        buf[prefix.len()] = b'{';
        buf[prefix.len() + 1..FLAG_LEN - 1].copy_from_slice(&core);
        buf[FLAG_LEN - 1] = b'}';
        Self(buf)
    }

    /// The random part between the braces
    pub fn core(&self) -> &str {
        let start = FLAG_PREFIX.len() + 1;
        // Only ASCII ever goes into the buffer
        std::str::from_utf8(&self.0[start..FLAG_LEN - 1]).unwrap_or_default()
    }

    /// Exact comparison against a submitted value
    pub fn verify(&self, candidate: &str) -> bool {
        candidate.as_bytes() == self.0
    }

    /// Redacted display form with separators at random offsets
    ///
    /// The result differs between calls and never verifies.
    pub fn masked(&self) -> String {
        let core = self.core();
        let mut rng = rand::thread_rng();
        let i = 2 + rng.gen_range(0..2);
        let j = i + 2 + rng.gen_range(0..2);
        format!(
            "{}{{{}-{}-{}}}",
            FLAG_PREFIX,
            &core[..i],
            &core[i..j],
            &core[j..]
        )
    }
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = std::str::from_utf8(&self.0).map_err(|_| fmt::Error)?;
        f.write_str(s)
    }
}

impl fmt::Debug for Flag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Flag({})", self)
    }
}

impl FromStr for Flag {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = s.as_bytes();
        let prefix = FLAG_PREFIX.as_bytes();
        let well_formed = bytes.len() == FLAG_LEN
            && bytes.starts_with(prefix)
            && bytes[prefix.len()] == b'{'
            && bytes[FLAG_LEN - 1] == b'}'
            && bytes[prefix.len() + 1..FLAG_LEN - 1]
                .iter()
                .all(|c| ALPHABET.contains(c));

        if !well_formed {
            return Err(Error::Validation(format!("invalid flag format: {}", s)));
        }

        let mut buf = [0u8; FLAG_LEN];
        buf.copy_from_slice(bytes);
        Ok(Self(buf))
    }
}

impl TryFrom<String> for Flag {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Flag> for String {
    fn from(flag: Flag) -> Self {
        flag.to_string()
    }
}

fn random_core<R: RngCore>(rng: &mut R) -> [u8; CORE_LEN] {
    let mut core = [0u8; CORE_LEN];
    let mut filled = 0;
    let mut cache = rng.next_u64();
    let mut remain = INDICES_PER_DRAW;

    while filled < CORE_LEN {
        if remain == 0 {
            cache = rng.next_u64();
            remain = INDICES_PER_DRAW;
        }
        let idx = (cache & INDEX_MASK) as usize;
        // Indices past the alphabet are skipped to keep the distribution uniform
        if idx < ALPHABET.len() {
            core[filled] = ALPHABET[idx];
            filled += 1;
        }
        cache >>= INDEX_BITS;
        remain -= 1;
    }

    core
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Constant source that counts how often it is drawn from
    struct CountingRng {
        value: u64,
        draws: usize,
    }

    impl RngCore for CountingRng {
        fn next_u32(&mut self) -> u32 {
            self.next_u64() as u32
        }

        fn next_u64(&mut self) -> u64 {
            self.draws += 1;
            self.value
        }

        fn fill_bytes(&mut self, dest: &mut [u8]) {
            dest.fill(self.value as u8);
        }

        fn try_fill_bytes(&mut self, dest: &mut [u8]) -> std::result::Result<(), rand::Error> {
            self.fill_bytes(dest);
            Ok(())
        }
    }

    #[test]
    fn test_flag_format_holds_for_many_tokens() {
        for _ in 0..10_000 {
            let flag = Flag::generate().to_string();

            assert_eq!(flag.len(), FLAG_LEN);
            assert!(flag.starts_with("FIRE{"));
            assert!(flag.ends_with('}'));
            let core = &flag[5..flag.len() - 1];
            assert_eq!(core.len(), CORE_LEN);
            assert!(core.bytes().all(|c| ALPHABET.contains(&c)), "bad core {}", core);
        }
    }

    #[test]
    fn test_alphabet_excludes_lookalikes() {
        for c in b"0O1Il" {
            assert!(!ALPHABET.contains(c), "{} should not be in the alphabet", *c as char);
        }
        assert!(ALPHABET.len() <= 1 << INDEX_BITS);
    }

    #[test]
    fn test_one_draw_covers_a_whole_core() {
        let mut rng = CountingRng { value: 0, draws: 0 };
        let core = random_core(&mut rng);

        assert_eq!(&core, b"aaaaaaaaaa");
        assert_eq!(rng.draws, 1);
    }

    #[test]
    fn test_rejected_indices_are_skipped() {
        // Low 6 bits are 63 (rejected), the next 6 bits are 1 ('b'), repeated
        let pattern = (0..INDICES_PER_DRAW / 2)
            .fold(0u64, |acc, n| acc | (0b000001_111111 << (12 * n)));
        let mut rng = CountingRng { value: pattern, draws: 0 };
        let core = random_core(&mut rng);

        assert_eq!(&core, b"bbbbbbbbbb");
        assert_eq!(rng.draws, 2);
    }

    #[test]
    fn test_parse_and_verify() {
        let flag = Flag::generate();
        let text = flag.to_string();

        let parsed: Flag = text.parse().unwrap();
        assert_eq!(parsed, flag);
        assert!(flag.verify(&text));
        assert!(!flag.verify(&text[..FLAG_LEN - 1]));
        assert!(!flag.verify(&format!(" {}", text)));
        assert!("FIRE{short}".parse::<Flag>().is_err());
        assert!("FLAG{abcdefghij}".parse::<Flag>().is_err());
        assert!("FIRE{abcdefgh0j}".parse::<Flag>().is_err());
    }

    #[test]
    fn test_masked_form_never_verifies() {
        let flag = Flag::generate();

        for _ in 0..50 {
            let masked = flag.masked();
            assert!(!flag.verify(&masked));
            assert!(masked.starts_with("FIRE{"));
            assert_eq!(masked.matches('-').count(), 2);
            assert_eq!(masked.replace('-', ""), flag.to_string());
        }
    }

    #[test]
    fn test_serde_uses_string_form() {
        let flag = Flag::generate();
        let json = serde_json::to_string(&flag).unwrap();
        assert_eq!(json, format!("\"{}\"", flag));

        let back: Flag = serde_json::from_str(&json).unwrap();
        assert_eq!(back, flag);
        assert!(serde_json::from_str::<Flag>("\"FIRE{nope}\"").is_err());
    }
}
