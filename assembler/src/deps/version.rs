//! Package versions, specifiers and requirement strings.
//!
//! Covers the subset of PEP 440 / PEP 508 that manifests and lockfiles use in
//! practice: numeric release segments with optional epoch, `a`/`b`/`rc`
//! pre-releases, post and dev releases, and the comparison operators
//! `==`, `!=`, `>=`, `<=`, `>`, `<`, `~=` plus `==X.*` prefix matching.
//! Extras and environment markers are parsed and ignored.

use assembler_shared::errors::{AssemblerError, AssemblerResult};
use regex::Regex;
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

static VERSION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^v?(?:(?P<epoch>\d+)!)?(?P<release>\d+(?:\.\d+)*)(?:[-_.]?(?P<pre_l>a|b|rc|c|alpha|beta|pre|preview)[-_.]?(?P<pre_n>\d*))?(?:-(?P<post_n1>\d+)|[-_.]?(?:post|rev|r)[-_.]?(?P<post_n2>\d*))?(?:[-_.]?dev[-_.]?(?P<dev_n>\d*))?$",
    )
    .expect("version regex is valid")
});

static REQUIREMENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<name>[A-Za-z0-9](?:[A-Za-z0-9._-]*[A-Za-z0-9])?)\s*(?:\[(?P<extras>[^\]]*)\])?\s*(?P<spec>[^;]*?)\s*(?:;(?P<marker>.*))?$",
    )
    .expect("requirement regex is valid")
});

/// Normalize a distribution name (PEP 503): lowercase, runs of `-`, `_`, `.`
/// collapsed to a single `-`.
pub fn normalize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_sep = false;
    for ch in name.trim().chars() {
        if matches!(ch, '-' | '_' | '.') {
            if !last_sep {
                out.push('-');
            }
            last_sep = true;
        } else {
            out.push(ch.to_ascii_lowercase());
            last_sep = false;
        }
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum PreKind {
    Alpha,
    Beta,
    Rc,
}

#[derive(Debug, Clone)]
pub struct Version {
    epoch: u64,
    release: Vec<u64>,
    pre: Option<(PreKind, u64)>,
    post: Option<u64>,
    dev: Option<u64>,
    raw: String,
}

impl Version {
    pub fn parse(input: &str) -> AssemblerResult<Self> {
        let raw = input.trim().to_string();
        let lowered = raw.to_ascii_lowercase();
        let caps = VERSION_RE
            .captures(&lowered)
            .ok_or_else(|| AssemblerError::Manifest(format!("invalid version '{}'", raw)))?;

        let number = |name: &str| -> AssemblerResult<Option<u64>> {
            match caps.name(name) {
                None => Ok(None),
                Some(m) if m.as_str().is_empty() => Ok(Some(0)),
                Some(m) => m.as_str().parse::<u64>().map(Some).map_err(|e| {
                    AssemblerError::Manifest(format!("invalid version '{}': {}", raw, e))
                }),
            }
        };

        let release = caps["release"]
            .split('.')
            .map(|seg| {
                seg.parse::<u64>()
                    .map_err(|e| AssemblerError::Manifest(format!("invalid version '{}': {}", raw, e)))
            })
            .collect::<AssemblerResult<Vec<_>>>()?;

        let pre = match caps.name("pre_l") {
            Some(label) => {
                let kind = match label.as_str() {
                    "a" | "alpha" => PreKind::Alpha,
                    "b" | "beta" => PreKind::Beta,
                    _ => PreKind::Rc,
                };
                Some((kind, number("pre_n")?.unwrap_or(0)))
            }
            None => None,
        };

        let post = match number("post_n1")? {
            Some(n) => Some(n),
            None => number("post_n2")?,
        };
        let dev = number("dev_n")?;
        let epoch = number("epoch")?.unwrap_or(0);

        Ok(Self {
            epoch,
            release,
            pre,
            post,
            dev,
            raw,
        })
    }

    pub fn release(&self) -> &[u64] {
        &self.release
    }

    pub fn is_prerelease(&self) -> bool {
        self.pre.is_some() || self.dev.is_some()
    }

    fn release_at(&self, idx: usize) -> u64 {
        self.release.get(idx).copied().unwrap_or(0)
    }

    /// Sort key for the pre/post/dev suffixes relative to the same release.
    /// A bare dev release sorts before any pre-release of that version.
    fn suffix_key(&self) -> (i8, u64, i64, i8, u64) {
        let (pre_rank, pre_n) = match (self.pre, self.post, self.dev) {
            (Some((kind, n)), _, _) => (kind as i8, n),
            (None, None, Some(_)) => (-1, 0),
            _ => (3, 0),
        };
        let post = self.post.map(|n| n as i64).unwrap_or(-1);
        let (dev_rank, dev_n) = match self.dev {
            Some(n) => (0, n),
            None => (1, 0),
        };
        (pre_rank, pre_n, post, dev_rank, dev_n)
    }
}

impl FromStr for Version {
    type Err = AssemblerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Version::parse(s)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.epoch
            .cmp(&other.epoch)
            .then_with(|| {
                let len = self.release.len().max(other.release.len());
                (0..len)
                    .map(|i| self.release_at(i).cmp(&other.release_at(i)))
                    .find(|o| *o != Ordering::Equal)
                    .unwrap_or(Ordering::Equal)
            })
            .then_with(|| self.suffix_key().cmp(&other.suffix_key()))
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Equal,
    NotEqual,
    GreaterEqual,
    LessEqual,
    Greater,
    Less,
    Compatible,
}

impl Operator {
    fn as_str(&self) -> &'static str {
        match self {
            Operator::Equal => "==",
            Operator::NotEqual => "!=",
            Operator::GreaterEqual => ">=",
            Operator::LessEqual => "<=",
            Operator::Greater => ">",
            Operator::Less => "<",
            Operator::Compatible => "~=",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Specifier {
    op: Operator,
    version: Version,
    /// `==1.4.*` / `!=1.4.*`
    wildcard: bool,
}

impl Specifier {
    pub fn parse(input: &str) -> AssemblerResult<Self> {
        let s = input.trim();
        let (op, rest) = [
            ("===", Operator::Equal),
            ("==", Operator::Equal),
            ("!=", Operator::NotEqual),
            (">=", Operator::GreaterEqual),
            ("<=", Operator::LessEqual),
            ("~=", Operator::Compatible),
            (">", Operator::Greater),
            ("<", Operator::Less),
        ]
        .iter()
        .find_map(|(prefix, op)| s.strip_prefix(prefix).map(|rest| (*op, rest.trim())))
        .ok_or_else(|| AssemblerError::Manifest(format!("invalid version specifier '{}'", s)))?;

        let (rest, wildcard) = match rest.strip_suffix(".*") {
            Some(prefix) if matches!(op, Operator::Equal | Operator::NotEqual) => (prefix, true),
            Some(_) => {
                return Err(AssemblerError::Manifest(format!(
                    "wildcard only allowed with == or != in '{}'",
                    s
                )));
            }
            None => (rest, false),
        };

        let version = Version::parse(rest)?;
        if op == Operator::Compatible && version.release.len() < 2 {
            return Err(AssemblerError::Manifest(format!(
                "'~=' needs at least two release segments in '{}'",
                s
            )));
        }

        Ok(Self {
            op,
            version,
            wildcard,
        })
    }

    pub fn contains(&self, candidate: &Version) -> bool {
        let target = &self.version;
        match self.op {
            Operator::Equal if self.wildcard => prefix_matches(target, candidate),
            Operator::NotEqual if self.wildcard => !prefix_matches(target, candidate),
            Operator::Equal => candidate == target,
            Operator::NotEqual => candidate != target,
            Operator::GreaterEqual => candidate >= target,
            Operator::LessEqual => candidate <= target,
            Operator::Greater => candidate > target,
            Operator::Less => candidate < target,
            Operator::Compatible => {
                let mut prefix = target.release.clone();
                prefix.pop();
                candidate >= target
                    && candidate.epoch == target.epoch
                    && prefix
                        .iter()
                        .enumerate()
                        .all(|(i, seg)| candidate.release_at(i) == *seg)
            }
        }
    }
}

fn prefix_matches(prefix: &Version, candidate: &Version) -> bool {
    candidate.epoch == prefix.epoch
        && prefix
            .release
            .iter()
            .enumerate()
            .all(|(i, seg)| candidate.release_at(i) == *seg)
}

impl fmt::Display for Specifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.op.as_str(), self.version)?;
        if self.wildcard {
            f.write_str(".*")?;
        }
        Ok(())
    }
}

/// Comma-separated conjunction of specifiers. Empty means "any version".
#[derive(Debug, Clone, Default)]
pub struct SpecifierSet(Vec<Specifier>);

impl SpecifierSet {
    pub fn parse(input: &str) -> AssemblerResult<Self> {
        let specs = input
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(Specifier::parse)
            .collect::<AssemblerResult<Vec<_>>>()?;
        Ok(Self(specs))
    }

    pub fn contains(&self, candidate: &Version) -> bool {
        self.0.iter().all(|spec| spec.contains(candidate))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether any specifier names a pre-release explicitly.
    pub fn allows_prereleases(&self) -> bool {
        self.0.iter().any(|spec| spec.version.is_prerelease())
    }
}

impl fmt::Display for SpecifierSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(ToString::to_string).collect();
        f.write_str(&parts.join(","))
    }
}

/// A dependency requirement such as `Django>=5.0,<6` or `psycopg2 (==2.9.9)`.
#[derive(Debug, Clone)]
pub struct Requirement {
    /// Normalized distribution name
    pub name: String,
    pub specifiers: SpecifierSet,
    raw: String,
}

impl Requirement {
    pub fn parse(input: &str) -> AssemblerResult<Self> {
        let raw = input.trim().to_string();
        if raw.contains('@') {
            return Err(AssemblerError::Manifest(format!(
                "direct URL requirements are not supported: '{}'",
                raw
            )));
        }

        let caps = REQUIREMENT_RE
            .captures(&raw)
            .ok_or_else(|| AssemblerError::Manifest(format!("invalid requirement '{}'", raw)))?;

        let spec = caps
            .name("spec")
            .map(|m| m.as_str().trim().trim_start_matches('(').trim_end_matches(')'))
            .unwrap_or("");

        Ok(Self {
            name: normalize_name(&caps["name"]),
            specifiers: SpecifierSet::parse(spec)?,
            raw,
        })
    }

    pub fn matches(&self, version: &Version) -> bool {
        self.specifiers.contains(version)
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name("Django"), "django");
        assert_eq!(normalize_name("zope.interface"), "zope-interface");
        assert_eq!(normalize_name("typing__extensions"), "typing-extensions");
    }

    #[test]
    fn test_version_ordering() {
        assert!(v("1.0.dev1") < v("1.0a1"));
        assert!(v("1.0a1") < v("1.0b2"));
        assert!(v("1.0b2") < v("1.0rc1"));
        assert!(v("1.0rc1") < v("1.0"));
        assert!(v("1.0") < v("1.0.post1"));
        assert!(v("1.0.post1") < v("1.0.1"));
        assert!(v("2.9.9") < v("2.10"));
        assert_eq!(v("1.0"), v("1.0.0"));
        assert!(v("1!0.1") > v("99.0"));
    }

    #[test]
    fn test_invalid_version() {
        assert!(Version::parse("not-a-version").is_err());
        assert!(Version::parse("").is_err());
    }

    #[test]
    fn test_specifiers() {
        let set = SpecifierSet::parse(">=5.0,<6").unwrap();
        assert!(set.contains(&v("5.0.6")));
        assert!(!set.contains(&v("6.0")));
        assert!(!set.contains(&v("4.2.13")));

        let compat = SpecifierSet::parse("~=2.2").unwrap();
        assert!(compat.contains(&v("2.9")));
        assert!(!compat.contains(&v("3.0")));

        let compat3 = SpecifierSet::parse("~=1.4.5").unwrap();
        assert!(compat3.contains(&v("1.4.9")));
        assert!(!compat3.contains(&v("1.5.0")));

        let wildcard = SpecifierSet::parse("==3.12.*").unwrap();
        assert!(wildcard.contains(&v("3.12.4")));
        assert!(!wildcard.contains(&v("3.11.9")));

        assert!(SpecifierSet::parse("").unwrap().contains(&v("0.0.1")));
        assert!(Specifier::parse(">=1.*").is_err());
        assert!(Specifier::parse("~=1").is_err());
    }

    #[test]
    fn test_requirement_parsing() {
        let req = Requirement::parse("Django>=5.0,<6").unwrap();
        assert_eq!(req.name, "django");
        assert!(req.matches(&v("5.0.6")));

        let req = Requirement::parse("psycopg2 (==2.9.9)").unwrap();
        assert_eq!(req.name, "psycopg2");
        assert!(req.matches(&v("2.9.9")));
        assert!(!req.matches(&v("2.9.8")));

        let req = Requirement::parse("uvicorn[standard]>=0.29 ; python_version >= '3.10'").unwrap();
        assert_eq!(req.name, "uvicorn");
        assert!(req.matches(&v("0.30.1")));

        let req = Requirement::parse("gunicorn").unwrap();
        assert!(req.specifiers.is_empty());

        assert!(Requirement::parse("pkg @ https://example.com/pkg.whl").is_err());
    }
}
