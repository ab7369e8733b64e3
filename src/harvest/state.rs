/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! `Last-Modified` memory between runs
//!
//! A flat YAML mapping from feed URL to the `Last-Modified` value of its last
//! successful fetch.

use crate::core::error::Result;
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use tracing::debug;

/// `Last-Modified` of each feed's previous fetch, keyed by URL
pub type LastModified = BTreeMap<String, String>;

/// Read the state file; a missing or empty file is an empty state
pub fn load(path: &Path) -> Result<LastModified> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!(path = ?path, "No state file yet");
            return Ok(LastModified::new());
        }
        Err(e) => return Err(e.into()),
    };
    if text.trim().is_empty() {
        return Ok(LastModified::new());
    }
    Ok(serde_yml::from_str(&text)?)
}

pub fn save(path: &Path, state: &LastModified) -> Result<()> {
    fs::write(path, serde_yml::to_string(state)?)?;
    debug!(path = ?path, feeds = state.len(), "State file written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::HarvestError;
    use std::path::PathBuf;

    fn scratch(name: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("harvester-{}-{name}.yaml", std::process::id()));
        let _ = fs::remove_file(&path);
        path
    }

    #[test]
    fn test_missing_file_is_empty_state() {
        let path = scratch("missing");
        assert!(load(&path).unwrap().is_empty());
    }

    #[test]
    fn test_state_survives_save_and_load() {
        let path = scratch("saved");
        let mut state = LastModified::new();
        state.insert(
            "http://example.test/feed.xml".to_string(),
            "Mon, 01 Jan 2024 00:00:00 GMT".to_string(),
        );
        save(&path, &state).unwrap();
        assert_eq!(load(&path).unwrap(), state);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_malformed_file_is_yaml_error() {
        let path = scratch("malformed");
        fs::write(&path, "- not\n- a mapping\n").unwrap();
        assert!(matches!(load(&path), Err(HarvestError::Yaml(_))));
        let _ = fs::remove_file(&path);
    }
}
