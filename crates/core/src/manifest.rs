//! Repository manifest (`.cvmfspublished`) parsing and export.
//!
//! The manifest is a newline-terminated keyval file where the key is the
//! first byte of each line. A line of `--` ends the keyval section (the
//! remainder carries the signature, which this crate does not interpret).

use crate::hash::is_hex_digest;
use serde::{Deserialize, Serialize};

/// Root hash of a tagged update channel (`Z` key).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelTag {
    pub channel: u8,
    pub root_hash: String,
}

/// Parsed repository manifest.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Root catalog hash (`C`, hex).
    pub catalog_hash: String,
    /// MD5 of the root path (`R`, hex).
    pub root_path_hash: String,
    /// Catalog TTL in seconds (`D`).
    pub ttl: u64,
    /// Repository revision (`S`).
    pub revision: u64,
    /// Micro catalog hash (`L`).
    pub micro_catalog_hash: Option<String>,
    /// Repository name (`N`).
    pub repository_name: Option<String>,
    /// Certificate hash (`X`).
    pub certificate_hash: Option<String>,
    /// History database hash (`H`).
    pub history_hash: Option<String>,
    /// Publish timestamp (`T`, unix seconds).
    pub publish_timestamp: Option<u64>,
    /// Channel tops (`Z`, repeatable).
    pub channel_tops: Vec<ChannelTag>,
}

impl Manifest {
    /// Parse a manifest from file contents.
    pub fn parse(input: &str) -> crate::Result<Self> {
        let mut content: Vec<(char, String)> = Vec::new();
        for line in input.lines() {
            if line == "--" {
                break;
            }
            if line.is_empty() {
                continue;
            }
            let key = line.chars().next().unwrap();
            content.push((key, line[key.len_utf8()..].to_string()));
        }

        let find = |key: char| {
            content
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.as_str())
        };
        let required = |key: char| {
            find(key).ok_or_else(|| {
                crate::Error::ManifestParse(format!("missing required key '{key}'"))
            })
        };
        let number = |key: char, value: &str| {
            value.parse::<u64>().map_err(|_| {
                crate::Error::ManifestParse(format!("key '{key}' is not a number: {value}"))
            })
        };
        let hash = |key: char, value: &str| {
            if is_hex_digest(value) {
                Ok(value.to_string())
            } else {
                Err(crate::Error::ManifestParse(format!(
                    "key '{key}' is not a hex hash: {value}"
                )))
            }
        };

        // Z lines accumulate; all other keys take the first occurrence.
        let mut channel_tops = Vec::new();
        for (key, value) in content.iter().filter(|(k, _)| *k == 'Z') {
            if value.len() <= 2 {
                return Err(crate::Error::ManifestParse(format!(
                    "malformed channel tag: {value}"
                )));
            }
            let channel = u8::from_str_radix(&value[..2], 16).map_err(|_| {
                crate::Error::ManifestParse(format!("bad channel id in '{value}'"))
            })?;
            channel_tops.push(ChannelTag {
                channel,
                root_hash: hash(*key, &value[2..])?,
            });
        }

        Ok(Manifest {
            catalog_hash: hash('C', required('C')?)?,
            root_path_hash: hash('R', required('R')?)?,
            ttl: number('D', required('D')?)?,
            revision: number('S', required('S')?)?,
            micro_catalog_hash: find('L').map(|v| hash('L', v)).transpose()?,
            repository_name: find('N').map(str::to_string),
            certificate_hash: find('X').map(|v| hash('X', v)).transpose()?,
            history_hash: find('H').map(|v| hash('H', v)).transpose()?,
            publish_timestamp: find('T').map(|v| number('T', v)).transpose()?,
            channel_tops,
        })
    }

    /// Serialize back to the keyval format (unsigned).
    pub fn export_string(&self) -> String {
        let mut out = format!(
            "C{}\nR{}\nD{}\nS{}\n",
            self.catalog_hash, self.root_path_hash, self.ttl, self.revision
        );
        if let Some(hash) = &self.micro_catalog_hash {
            out.push_str(&format!("L{hash}\n"));
        }
        if let Some(name) = &self.repository_name {
            out.push_str(&format!("N{name}\n"));
        }
        if let Some(hash) = &self.certificate_hash {
            out.push_str(&format!("X{hash}\n"));
        }
        if let Some(hash) = &self.history_hash {
            out.push_str(&format!("H{hash}\n"));
        }
        if let Some(ts) = self.publish_timestamp {
            out.push_str(&format!("T{ts}\n"));
        }
        for tag in &self.channel_tops {
            out.push_str(&format!("Z{:02x}{}\n", tag.channel, tag.root_hash));
        }
        out
    }
}
