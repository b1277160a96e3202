//! Replication pair specs.
//!
//! A pair is written `src[@host]:dst[@host]`. Parsing and the root-dataset
//! destination guard live here; the liveness and existence probes run in
//! the engine, where an executor is available.

use crate::config::Config;
use crate::dataset::Dataset;
use crate::error::PairError;
use serde::Serialize;

/// One parsed replication pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Pair {
    pub src: Dataset,
    pub src_host: Option<String>,
    pub dst: Dataset,
    pub dst_host: Option<String>,
}

impl Pair {
    /// Parse a single `src[@host]:dst[@host]` spec.
    ///
    /// The halves are split on the first `:`; trailing whitespace on each
    /// half is ignored. Within a half, everything after an `@` is the host.
    pub fn parse(spec: &str) -> Result<Self, PairError> {
        let Some((src_half, dst_half)) = spec.split_once(':') else {
            return Err(PairError::MissingSeparator {
                spec: spec.to_string(),
            });
        };
        let (src, src_host) = split_host(spec, src_half.trim_end(), "source")?;
        let (dst, dst_host) = split_host(spec, dst_half.trim_end(), "destination")?;
        Ok(Self {
            src: Dataset::new(src),
            src_host,
            dst: Dataset::new(dst),
            dst_host,
        })
    }

    /// Reject a destination that resolves to a root dataset unless the
    /// configuration explicitly permits it. Replicated sources land at
    /// `dst/src`, so an allowed root destination still never overwrites
    /// the pool itself.
    pub fn check_destination(&self, cfg: &Config) -> Result<(), PairError> {
        if self.dst.is_root() && !cfg.allow_root_datasets {
            return Err(PairError::RootDataset {
                dataset: self.dst.as_str().to_string(),
            });
        }
        Ok(())
    }

    /// The distinct non-local hosts this pair touches, for liveness probes.
    pub fn hosts(&self) -> Vec<&str> {
        let mut hosts: Vec<&str> = Vec::new();
        for host in [self.src_host.as_deref(), self.dst_host.as_deref()]
            .into_iter()
            .flatten()
        {
            if !hosts.contains(&host) {
                hosts.push(host);
            }
        }
        hosts
    }
}

impl std::fmt::Display for Pair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.src)?;
        if let Some(h) = &self.src_host {
            write!(f, "@{h}")?;
        }
        write!(f, ":{}", self.dst)?;
        if let Some(h) = &self.dst_host {
            write!(f, "@{h}")?;
        }
        Ok(())
    }
}

fn split_host(
    spec: &str,
    half: &str,
    side: &'static str,
) -> Result<(String, Option<String>), PairError> {
    let (dataset, host) = match half.split_once('@') {
        Some((dataset, host)) => {
            if host.is_empty() {
                return Err(PairError::EmptyHost {
                    spec: spec.to_string(),
                });
            }
            (dataset, Some(host.to_string()))
        }
        None => (half, None),
    };
    if dataset.is_empty() {
        return Err(PairError::EmptyDataset {
            spec: spec.to_string(),
            side,
        });
    }
    Ok((dataset.to_string(), host))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_local_to_local() {
        let pair = Pair::parse("p1/a:p2").unwrap();
        assert_eq!(pair.src.as_str(), "p1/a");
        assert_eq!(pair.src_host, None);
        assert_eq!(pair.dst.as_str(), "p2");
        assert_eq!(pair.dst_host, None);
    }

    #[test]
    fn parses_hosts_on_both_sides() {
        let pair = Pair::parse("p1/a@alpha:p2/backup@beta").unwrap();
        assert_eq!(pair.src_host.as_deref(), Some("alpha"));
        assert_eq!(pair.dst_host.as_deref(), Some("beta"));
        assert_eq!(pair.dst.as_str(), "p2/backup");
    }

    #[test]
    fn trailing_whitespace_is_trimmed() {
        let pair = Pair::parse("p1/a :p2 ").unwrap();
        assert_eq!(pair.src.as_str(), "p1/a");
        assert_eq!(pair.dst.as_str(), "p2");
    }

    #[test]
    fn missing_separator_is_rejected() {
        assert!(matches!(
            Pair::parse("p1/a"),
            Err(PairError::MissingSeparator { .. })
        ));
    }

    #[test]
    fn empty_sides_are_rejected() {
        assert!(matches!(
            Pair::parse(":p2"),
            Err(PairError::EmptyDataset { side: "source", .. })
        ));
        assert!(matches!(
            Pair::parse("p1/a:"),
            Err(PairError::EmptyDataset {
                side: "destination",
                ..
            })
        ));
        assert!(matches!(
            Pair::parse("p1/a@:p2"),
            Err(PairError::EmptyHost { .. })
        ));
    }

    #[test]
    fn root_destination_requires_override() {
        let pair = Pair::parse("a:b").unwrap();
        let cfg = Config::for_testing(&["a:b"], "t");
        assert!(matches!(
            pair.check_destination(&cfg),
            Err(PairError::RootDataset { .. })
        ));

        let mut cfg = cfg;
        cfg.allow_root_datasets = true;
        assert!(pair.check_destination(&cfg).is_ok());
    }

    #[test]
    fn non_root_destination_passes() {
        let pair = Pair::parse("a:b/c").unwrap();
        let cfg = Config::for_testing(&["a:b/c"], "t");
        assert!(pair.check_destination(&cfg).is_ok());
    }

    #[test]
    fn hosts_deduplicates() {
        let pair = Pair::parse("p1/a@h1:p2@h1").unwrap();
        assert_eq!(pair.hosts(), vec!["h1"]);
        let pair = Pair::parse("p1/a@h1:p2@h2").unwrap();
        assert_eq!(pair.hosts(), vec!["h1", "h2"]);
        let pair = Pair::parse("p1/a:p2").unwrap();
        assert!(pair.hosts().is_empty());
    }

    #[test]
    fn display_round_trips() {
        for spec in ["p1/a:p2", "p1/a@alpha:p2@beta", "p1:p2/x@h"] {
            assert_eq!(Pair::parse(spec).unwrap().to_string(), spec);
        }
    }
}
