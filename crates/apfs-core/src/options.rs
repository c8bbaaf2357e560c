//! Mount options: a comma-separated `key=value` list.
//!
//! `vol=` selects the volume index, `uid=`/`gid=` override the displayed
//! owner and group. Unknown or malformed options fail the mount; the
//! filesystem is read-only regardless of what the caller asks for.

use apfs_error::{ApfsError, Result};
use std::fmt;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MountOptions {
    pub vol: u32,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

impl MountOptions {
    /// Parse an option string such as `"vol=1,uid=501"`.
    ///
    /// Empty segments are ignored so trailing commas are harmless.
    pub fn parse(options: &str) -> Result<Self> {
        let mut parsed = Self::default();

        for item in options.split(',') {
            if item.is_empty() {
                continue;
            }
            let Some((key, value)) = item.split_once('=') else {
                return Err(ApfsError::Invalid(format!("malformed mount option: {item}")));
            };
            let number: u32 = value
                .parse()
                .map_err(|_| ApfsError::Invalid(format!("invalid value in mount option: {item}")))?;
            match key {
                "vol" => parsed.vol = number,
                "uid" => parsed.uid = Some(number),
                "gid" => parsed.gid = Some(number),
                _ => {
                    return Err(ApfsError::Invalid(format!("unknown mount option: {key}")));
                }
            }
        }

        Ok(parsed)
    }
}

/// Emits only non-default options, in mount-option syntax.
impl fmt::Display for MountOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.vol != 0 {
            write!(f, ",vol={}", self.vol)?;
        }
        if let Some(uid) = self.uid {
            write!(f, ",uid={uid}")?;
        }
        if let Some(gid) = self.gid {
            write!(f, ",gid={gid}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let opts = MountOptions::parse("").expect("empty options");
        assert_eq!(opts, MountOptions::default());
        assert_eq!(opts.vol, 0);
        assert_eq!(opts.to_string(), "");
    }

    #[test]
    fn full_set() {
        let opts = MountOptions::parse("vol=1,uid=501,gid=20").expect("parse");
        assert_eq!(opts.vol, 1);
        assert_eq!(opts.uid, Some(501));
        assert_eq!(opts.gid, Some(20));
        assert_eq!(opts.to_string(), ",vol=1,uid=501,gid=20");
    }

    #[test]
    fn trailing_comma_tolerated() {
        let opts = MountOptions::parse("vol=2,").expect("parse");
        assert_eq!(opts.vol, 2);
    }

    #[test]
    fn unknown_option_rejected() {
        let err = MountOptions::parse("rw=1").unwrap_err();
        assert!(matches!(err, ApfsError::Invalid(_)), "got: {err:?}");
    }

    #[test]
    fn malformed_option_rejected() {
        assert!(MountOptions::parse("vol").is_err());
        assert!(MountOptions::parse("uid=abc").is_err());
        assert!(MountOptions::parse("uid=-1").is_err());
    }

    #[test]
    fn display_skips_defaults() {
        let opts = MountOptions::parse("uid=0").expect("parse");
        // uid=0 is an explicit override, not a default.
        assert_eq!(opts.to_string(), ",uid=0");
        let opts = MountOptions::parse("vol=0").expect("parse");
        assert_eq!(opts.to_string(), "");
    }
}
