// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use log::debug;

use std::fs::{File, OpenOptions};
use std::io::{BufRead as _, BufReader, BufWriter, Write as _};
use std::path::{Path, PathBuf};

/// Counter names discovered by a previous run, one per line.
///
/// Line position is the slot id, so the file must be written in slot order
/// and by a single writer.
#[derive(Debug, Clone)]
pub struct NameCache {
    path: PathBuf,
}

impl NameCache {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns `None` when there is no cache yet.
    pub fn load(&self) -> std::io::Result<Option<Vec<String>>> {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        let mut names = Vec::new();
        for line in BufReader::new(file).lines() {
            names.push(line?);
        }
        debug!("Loaded {} counter names from {:?}", names.len(), self.path);
        Ok(Some(names))
    }

    /// Appends `names` in order, one line each.
    pub fn append<I, S>(&self, names: I) -> std::io::Result<usize>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let mut writer = BufWriter::new(file);
        let mut n = 0;
        for name in names {
            writeln!(writer, "{}", name.as_ref())?;
            n += 1;
        }
        writer.flush()?;
        debug!("Appended {} counter names to {:?}", n, self.path);
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = NameCache::new(dir.path().join("names.txt"));
        assert_eq!(cache.load().unwrap(), None);
    }

    #[test]
    fn round_trip_keeps_order() {
        let dir = tempfile::tempdir().unwrap();
        let cache = NameCache::new(dir.path().join("names.txt"));
        let names = vec![
            "UCX@1_uct_ep_bytes_short",
            "UCX@1_uct_ep_am",
            "UCX@1_ucp_worker_rndv",
        ];
        assert_eq!(cache.append(&names).unwrap(), 3);
        assert_eq!(cache.load().unwrap().unwrap(), names);

        let raw = std::fs::read_to_string(cache.path()).unwrap();
        assert!(raw.ends_with("ucp_worker_rndv\n"));
    }

    #[test]
    fn writer_only_appends() {
        let dir = tempfile::tempdir().unwrap();
        let cache = NameCache::new(dir.path().join("names.txt"));
        cache.append(["a", "b"]).unwrap();
        cache.append(["c"]).unwrap();
        assert_eq!(cache.load().unwrap().unwrap(), vec!["a", "b", "c"]);
    }
}
