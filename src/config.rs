// aff4 is a library implementing the AFF4 evidence container format.
// Copyright (C) 2024  Himbeer <himbeerserverde@gmail.com>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use crate::Aff4Error;

use std::fs;
use std::path::Path;
use std::thread;

use serde::{Deserialize, Serialize};

/// Zip compression method: members are stored uncompressed.
pub const COMPRESSION_STORED: u16 = 0;
/// Zip compression method: members are raw-DEFLATE compressed.
pub const COMPRESSION_DEFLATE: u16 = 8;

/// An `ImagerConfig` carries the acquisition tunables an imager
/// front-end feeds into the library: how image streams are chunked,
/// how hard the worker pool runs and how large the object cache is.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ImagerConfig {
    /// The unit of compression within a bevy, in bytes.
    pub chunk_size: u32,
    /// The number of chunks grouped into one bevy.
    pub chunks_in_segment: u32,
    /// The Zip compression method applied to image chunks.
    pub compression: u16,
    /// The number of compression workers per image stream.
    pub workers: usize,
    /// The number of entries the resolver's object cache may hold.
    pub cache_capacity: usize,
}

impl ImagerConfig {
    pub const PATH: &'static str = "/etc/aff4.conf";

    /// Loads the configuration file of the current machine.
    pub fn load() -> Result<Self, Aff4Error> {
        Self::load_from(Self::PATH)
    }

    /// Loads a configuration file from the specified location.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, Aff4Error> {
        let s = fs::read_to_string(path)?;
        Ok(toml::from_str(&s)?)
    }

    /// Saves the configuration to the configuration file on the current machine.
    pub fn save(&self) -> Result<(), Aff4Error> {
        self.save_to(Self::PATH)
    }

    /// Saves the configuration to the specified location.
    pub fn save_to<P: AsRef<Path>>(&self, path: P) -> Result<(), Aff4Error> {
        let s = toml::to_string_pretty(self)?;

        fs::write(path, s)?;
        Ok(())
    }
}

impl Default for ImagerConfig {
    fn default() -> Self {
        Self {
            chunk_size: 32 * 1024,
            chunks_in_segment: 2048,
            compression: COMPRESSION_DEFLATE,
            workers: default_workers(),
            cache_capacity: 64,
        }
    }
}

/// Returns the default worker count: one per hardware context,
/// never fewer than two.
pub fn default_workers() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2)
        .max(2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = ImagerConfig::default();

        assert_eq!(config.chunk_size, 32 * 1024);
        assert_eq!(config.compression, COMPRESSION_DEFLATE);
        assert!(config.workers >= 2);
    }

    #[test]
    fn toml_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aff4.conf");

        let config = ImagerConfig {
            chunk_size: 4096,
            chunks_in_segment: 16,
            compression: COMPRESSION_STORED,
            workers: 3,
            cache_capacity: 32,
        };

        config.save_to(&path).unwrap();
        assert_eq!(ImagerConfig::load_from(&path).unwrap(), config);
    }
}
