//! Run-time configuration.
//!
//! Options can be set programmatically, from `SVRC_`-prefixed environment
//! variables, or from a text file of `option value` pairs (one per line,
//! `#` starts a comment line). File and environment keys are matched
//! case-insensitively and ignoring underscores, so `recommendOnlyRCGC`
//! in a file sets [`Options::recommend_only_rc_gc`].

use std::fmt::Debug;
use std::io::{BufRead, BufReader};

fn always_valid<T>(_: &T) -> bool {
    true
}

/// Parse an option value from its textual form. Booleans additionally
/// accept `0`/`1`, which is what option files historically used.
pub trait FromOptionStr: Sized {
    fn parse_option(s: &str) -> Option<Self>;
}

impl FromOptionStr for bool {
    fn parse_option(s: &str) -> Option<bool> {
        match s {
            "0" => Some(false),
            "1" => Some(true),
            _ => s.parse().ok(),
        }
    }
}

impl FromOptionStr for usize {
    fn parse_option(s: &str) -> Option<usize> {
        s.parse().ok()
    }
}

impl FromOptionStr for i32 {
    fn parse_option(s: &str) -> Option<i32> {
        s.parse().ok()
    }
}

/// An SVRC option of a given type, with a validator run on every set.
/// To read the value, dereference it (for example, `*options.uni_prio`).
#[derive(Clone)]
pub struct SVRCOption<T: Debug + Clone> {
    value: T,
    validator: fn(&T) -> bool,
}

impl<T: Debug + Clone> SVRCOption<T> {
    pub fn new(value: T, validator: fn(&T) -> bool) -> Self {
        Self { value, validator }
    }

    /// Set the option to the given value. Returns false if the value is
    /// invalid for this option.
    pub fn set(&mut self, value: T) -> bool {
        if (self.validator)(&value) {
            self.value = value;
            true
        } else {
            false
        }
    }
}

impl<T: Debug + Clone> std::ops::Deref for SVRCOption<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.value
    }
}

fn normalize_key(key: &str) -> String {
    key.chars()
        .filter(|c| *c != '_')
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

macro_rules! options {
    ($($(#[$outer:meta])* $name:ident: $type:ty [$validator:expr] = $default:expr),* $(,)?) => [
        /// The set of recognized options.
        #[derive(Clone)]
        pub struct Options {
            $($(#[$outer])* pub $name: SVRCOption<$type>),*
        }

        impl Options {
            fn new() -> Self {
                Options {
                    $($name: SVRCOption::new($default, $validator)),*
                }
            }

            /// Set an option from its textual key and value. Returns
            /// false for unknown keys or invalid values.
            pub fn set_from_str(&mut self, key: &str, val: &str) -> bool {
                let k = normalize_key(key);
                $(
                    if k == normalize_key(stringify!($name)) {
                        return match <$type as FromOptionStr>::parse_option(val) {
                            Some(v) => {
                                let ok = self.$name.set(v);
                                if !ok {
                                    warn!("unable to set {}={}: invalid value", key, val);
                                }
                                ok
                            }
                            None => {
                                warn!("unable to set {}={}: can't parse value", key, val);
                                false
                            }
                        };
                    }
                )*
                warn!("unknown option {}", key);
                false
            }

            /// Read options from environment variables starting with
            /// `SVRC_` (such as `SVRC_USER_BUFF_TRIG`), and apply them.
            pub fn read_env_var_settings(&mut self) {
                const PREFIX: &str = "SVRC_";
                for (key, val) in std::env::vars() {
                    if let Some(rest_of_key) = key.strip_prefix(PREFIX) {
                        self.set_from_str(rest_of_key, &val);
                    }
                }
            }
        }

        impl Default for Options {
            fn default() -> Self {
                Self::new()
            }
        }
    ]
}

impl Options {
    /// Read options from a text file of `option value` pairs. Lines
    /// starting with `#` are comments. Returns an error for unreadable
    /// files or malformed lines; unknown options are reported and
    /// skipped.
    pub fn read_file_settings(&mut self, path: &str) -> std::io::Result<()> {
        let f = std::fs::File::open(path)?;
        for line in BufReader::new(f).lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.split_ascii_whitespace();
            match (parts.next(), parts.next()) {
                (Some(key), Some(val)) => {
                    self.set_from_str(key, val);
                }
                _ => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("malformed option line: {:?}", line),
                    ))
                }
            }
        }
        Ok(())
    }
}

fn is_percent(v: &usize) -> bool {
    *v <= 100
}

options! {
    /// When choosing the next cycle's mode adaptively, never pick
    /// tracing.
    recommend_only_rc_gc: bool [always_valid] = false,
    /// Pin every cycle to reference counting.
    use_only_rc_gc: bool [always_valid] = false,
    /// Pin every cycle to tracing.
    use_only_tracing_gc: bool [always_valid] = false,
    /// Percent of list-held blocks counted as available in the
    /// allocation-trigger arithmetic.
    list_blk_worth: usize [is_percent] = 80,
    /// Number of write-buffer chunks handed to mutators that triggers an
    /// asynchronous collection.
    user_buff_trig: usize [|v| *v > 0] = 8,
    /// Starting value of the allocation trigger, as a percent of total
    /// blocks.
    initial_high_trig_mark: usize [is_percent] = 10,
    /// Offset (percent of total blocks) above the trigger that defines
    /// the post-cycle low-water mark.
    low_trig_delta: usize [is_percent] = 5,
    /// Percent of total blocks by which the trigger is advanced when a
    /// cycle ends short of the low-water mark.
    raise_trig_inc: usize [is_percent] = 5,
    /// Percent of total blocks by which the trigger is relaxed when a
    /// cycle ends with slack.
    lower_trig_dec: usize [is_percent] = 5,
    /// Collector thread priority on single-CPU hosts.
    uni_prio: i32 [always_valid] = 9,
    /// Collector thread priority on multi-CPU hosts.
    multi_prio: i32 [always_valid] = 10,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_from_str_matches_legacy_keys() {
        let mut opts = Options::default();
        assert!(opts.set_from_str("recommendOnlyRCGC", "1"));
        assert!(*opts.recommend_only_rc_gc);
        assert!(opts.set_from_str("listBlkWorth", "40"));
        assert_eq!(*opts.list_blk_worth, 40);
        assert!(opts.set_from_str("user_buff_trig", "16"));
        assert_eq!(*opts.user_buff_trig, 16);
    }

    #[test]
    fn rejects_bad_values() {
        let mut opts = Options::default();
        assert!(!opts.set_from_str("listBlkWorth", "101"));
        assert_eq!(*opts.list_blk_worth, 80);
        assert!(!opts.set_from_str("noSuchOption", "1"));
        assert!(!opts.set_from_str("userBuffTrig", "zero"));
    }

    #[test]
    fn reads_option_file() {
        use std::io::Write;
        let dir = std::env::temp_dir();
        let path = dir.join(format!("svrc-options-{}.txt", std::process::id()));
        {
            let mut f = std::fs::File::create(&path).unwrap();
            writeln!(f, "# collector options").unwrap();
            writeln!(f, "useOnlyRCGC 1").unwrap();
            writeln!(f, "initialHighTrigMark 25").unwrap();
        }
        let mut opts = Options::default();
        opts.read_file_settings(path.to_str().unwrap()).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert!(*opts.use_only_rc_gc);
        assert_eq!(*opts.initial_high_trig_mark, 25);
    }
}
