//! Protected-prefix and whitelist tries
//!
//! Binary trie over MSB-first IPv4 address bits with longest-prefix lookup.
//! Protected entries carry a sensitivity value that is converted to a CUSUM
//! threshold multiplier at load time; whitelist entries carry nothing.
//!
//! File format, one entry per line: `IP[/prefix] [sensitivity]`. Prefix
//! defaults to 32, sensitivity to 0.5. Blank lines and `#` comments are
//! skipped; anything else that fails to parse aborts loading.

use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;

use ipnetwork::Ipv4Network;
use thiserror::Error;
use tracing::debug;

/// Scale of the sensitivity growth curve: `multiplier = SCALE * DECAY^s`.
pub const SENSITIVITY_SCALE: f64 = 100.0;
/// Decay base of the sensitivity growth curve.
pub const SENSITIVITY_DECAY: f64 = 0.015;
/// Sensitivity assumed when a protected entry does not specify one.
pub const DEFAULT_SENSITIVITY: f64 = 0.5;

/// Convert an operator-facing sensitivity into the internal threshold
/// multiplier. Higher sensitivity gives a smaller multiplier, so detection
/// fires earlier.
pub fn sensitivity_to_multiplier(sensitivity: f64) -> f64 {
    SENSITIVITY_SCALE * SENSITIVITY_DECAY.powf(sensitivity)
}

#[derive(Debug, Error)]
pub enum PrefixFileError {
    #[error("failed to read {path}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{path}:{line}: invalid prefix entry: {text:?}")]
    Parse {
        path: String,
        line: usize,
        text: String,
    },

    #[error("no valid prefixes in {path}")]
    Empty { path: String },
}

#[derive(Debug, Default)]
struct Node {
    children: [Option<Box<Node>>; 2],
    /// Set when a stored prefix ends here; carries the multiplier if the
    /// trie holds protected entries.
    terminal: Option<Option<f64>>,
}

/// Longest-prefix-match trie over IPv4 addresses.
#[derive(Debug, Default)]
pub struct PrefixTrie {
    root: Node,
    len: usize,
}

impl PrefixTrie {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Store `network`, optionally tagged with a multiplier.
    pub fn insert(&mut self, network: Ipv4Network, multiplier: Option<f64>) {
        let bits = u32::from(network.network());
        let mut node = &mut self.root;
        for i in 0..network.prefix() {
            let bit = ((bits >> (31 - i)) & 1) as usize;
            node = node.children[bit].get_or_insert_with(Box::default);
        }
        if node.terminal.is_none() {
            self.len += 1;
        }
        node.terminal = Some(multiplier);
    }

    /// True when any stored prefix covers `addr`.
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        self.walk(addr).is_some()
    }

    /// Multiplier stored on the longest prefix covering `addr`.
    pub fn lookup(&self, addr: Ipv4Addr) -> Option<f64> {
        self.walk(addr).flatten()
    }

    /// Terminal marker of the longest matching prefix, if any.
    fn walk(&self, addr: Ipv4Addr) -> Option<Option<f64>> {
        let bits = u32::from(addr);
        let mut node = &self.root;
        let mut found = self.root.terminal;
        for i in 0..32 {
            let bit = ((bits >> (31 - i)) & 1) as usize;
            match &node.children[bit] {
                Some(child) => {
                    node = child;
                    if node.terminal.is_some() {
                        found = node.terminal;
                    }
                }
                None => break,
            }
        }
        found
    }
}

/// Parse one `IP[/prefix] [sensitivity]` line.
fn parse_line(text: &str) -> Option<(Ipv4Network, f64)> {
    let mut parts = text.split_whitespace();
    let network: Ipv4Network = parts.next()?.parse().ok()?;
    let sensitivity = match parts.next() {
        Some(token) => token.parse::<f64>().ok()?,
        None => DEFAULT_SENSITIVITY,
    };
    if parts.next().is_some() {
        return None;
    }
    Some((network, sensitivity))
}

fn load(path: &Path, with_multiplier: bool) -> Result<PrefixTrie, PrefixFileError> {
    let display = path.display().to_string();
    let content = fs::read_to_string(path).map_err(|source| PrefixFileError::Io {
        path: display.clone(),
        source,
    })?;

    let mut trie = PrefixTrie::new();
    for (idx, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (network, sensitivity) =
            parse_line(line).ok_or_else(|| PrefixFileError::Parse {
                path: display.clone(),
                line: idx + 1,
                text: line.to_string(),
            })?;
        let multiplier = with_multiplier.then(|| sensitivity_to_multiplier(sensitivity));
        debug!(%network, sensitivity, "loaded prefix");
        trie.insert(network, multiplier);
    }
    if trie.is_empty() {
        return Err(PrefixFileError::Empty { path: display });
    }
    Ok(trie)
}

/// Load a protected-prefix file; sensitivities become multipliers.
pub fn load_protected(path: &Path) -> Result<PrefixTrie, PrefixFileError> {
    load(path, true)
}

/// Load a whitelist file; sensitivities are accepted and ignored.
pub fn load_whitelist(path: &Path) -> Result<PrefixTrie, PrefixFileError> {
    load(path, false)
}
