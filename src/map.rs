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

use crate::config::COMPRESSION_DEFLATE;
use crate::rdf::{
    Value, AFF4_BLOCKSIZE, AFF4_IMAGE_PERIOD, AFF4_MAP_DATA, AFF4_SIZE, AFF4_STORED,
    AFF4_TARGET_PERIOD, AFF4_TIMESTAMP, AFF4_TYPE, TYPE_MAP,
};
use crate::resolver::{Resolver, Volume as _};
use crate::stream::{resolve_seek, Mode, Stream};
use crate::urn::Urn;
use crate::zip::read_member_bytes;
use crate::Aff4Error;

use std::collections::HashMap;
use std::io::SeekFrom;
use std::sync::Arc;

use chrono::Utc;

/// One sample of the offset translation, in blocksize units.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MapPoint {
    /// The logical stream offset this point anchors.
    pub image_offset: u64,
    /// The offset within the target the anchor maps to.
    pub target_offset: u64,
    /// Index into the map's target table.
    pub target_index: u32,
}

/// A `MapStream` translates logical stream bytes into (target URN,
/// target offset) pairs by linear interpolation between sorted map
/// points, with an optional periodic repetition for RAID-style layouts.
///
/// Offsets held in map points are in `blocksize` units; logical reads
/// and the period attributes are in bytes. An absent target ("sparse")
/// reads as zeros without ever opening a target stream.
pub struct MapStream {
    urn: Urn,
    stored: Urn,
    points: Vec<MapPoint>,
    targets: Vec<Option<Urn>>,
    target_lookup: HashMap<String, u32>,
    size: u64,
    image_period: Option<u64>,
    target_period: Option<u64>,
    blocksize: u64,
    readptr: u64,
    mode: Mode,
    closed: bool,
    pad_on_error: bool,
}

impl MapStream {
    fn empty(urn: &Urn, stored: &Urn, mode: Mode) -> Self {
        Self {
            urn: urn.clone(),
            stored: stored.clone(),
            points: Vec::new(),
            targets: Vec::new(),
            target_lookup: HashMap::new(),
            size: 0,
            image_period: None,
            target_period: None,
            blocksize: 1,
            readptr: 0,
            mode,
            closed: false,
            pad_on_error: false,
        }
    }

    /// Creates a new map stream hosted by `volume`.
    pub fn create(resolver: &Resolver, urn: &Urn, volume: &Urn) -> Result<Self, Aff4Error> {
        resolver.set(urn, AFF4_STORED, Value::Urn(volume.clone()));
        resolver.set(urn, AFF4_TYPE, Value::from(TYPE_MAP));
        resolver.set(urn, AFF4_TIMESTAMP, Value::from(Utc::now()));

        Ok(Self::empty(urn, volume, Mode::Write))
    }

    /// Materialises read access to a sealed map stream: its parameters
    /// come from the resolver, its points from the `map` segment.
    pub fn load(resolver: &Arc<Resolver>, urn: &Urn) -> Result<Self, Aff4Error> {
        let stored = resolver.resolve_urn(urn, AFF4_STORED)?;

        let mut map = Self::empty(urn, &stored, Mode::Read);
        map.size = resolver.resolve_integer(urn, AFF4_SIZE)? as u64;
        map.image_period = resolver
            .resolve_integer(urn, AFF4_IMAGE_PERIOD)
            .ok()
            .map(|p| p as u64);
        map.target_period = resolver
            .resolve_integer(urn, AFF4_TARGET_PERIOD)
            .ok()
            .map(|p| p as u64);
        map.blocksize = resolver
            .resolve_integer(urn, AFF4_BLOCKSIZE)
            .map(|b| b as u64)
            .unwrap_or(1)
            .max(1);

        let segment = urn.join("map");
        let bytes = read_member_bytes(resolver, &segment)?;
        map.parse_csv(&String::from_utf8_lossy(&bytes));

        Ok(map)
    }

    /// Returns the [`Mode`] of the map stream.
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Sets the logical size in bytes.
    pub fn set_size(&mut self, size: u64) {
        self.size = size;
    }

    /// Sets the repetition periods: every `image_period` logical bytes
    /// the layout repeats, shifted by `target_period` bytes within each
    /// target.
    pub fn set_periods(&mut self, image_period: u64, target_period: u64) {
        self.image_period = Some(image_period);
        self.target_period = Some(target_period);
    }

    /// Sets the constant multiple applied to map point offsets.
    pub fn set_blocksize(&mut self, blocksize: u64) {
        self.blocksize = blocksize.max(1);
    }

    /// Selects whether unreadable target ranges read as zeros instead
    /// of surfacing the target's error.
    pub fn set_pad_on_error(&mut self, pad: bool) {
        self.pad_on_error = pad;
    }

    fn intern_target(&mut self, target: Option<&Urn>) -> u32 {
        let key = target.map(|t| t.to_string()).unwrap_or_default();

        if let Some(&index) = self.target_lookup.get(&key) {
            return index;
        }

        let index = self.targets.len() as u32;
        self.targets.push(target.cloned());
        self.target_lookup.insert(key, index);

        index
    }

    /// Inserts a map point at `image_offset` blocks. A later point at
    /// the same offset replaces the earlier one.
    pub fn add_point(&mut self, image_offset: u64, target_offset: u64, target: Option<&Urn>) {
        let point = MapPoint {
            image_offset,
            target_offset,
            target_index: self.intern_target(target),
        };

        match self
            .points
            .binary_search_by_key(&image_offset, |p| p.image_offset)
        {
            Ok(i) => self.points[i] = point,
            Err(i) => self.points.insert(i, point),
        }
    }

    /// Removes the point anchored at `image_offset` blocks, if any.
    pub fn del(&mut self, image_offset: u64) {
        if let Ok(i) = self
            .points
            .binary_search_by_key(&image_offset, |p| p.image_offset)
        {
            self.points.remove(i);
        }
    }

    /// Simulates copying `len` bytes from `(target, target_offset)` to
    /// the current logical end: adds the matching point and grows the
    /// stream. Offsets must be blocksize-aligned.
    pub fn write_from(&mut self, target: &Urn, target_offset: u64, len: u64) {
        self.add_point(
            self.size / self.blocksize,
            target_offset / self.blocksize,
            Some(target),
        );
        self.size += len;
    }

    /// Resolves the logical byte `offset`: the target (or `None` for a
    /// sparse range), the byte offset within it, and how many bytes the
    /// answer is valid for.
    pub fn get_range(&self, offset: u64) -> (Option<&Urn>, u64, u64) {
        if offset >= self.size {
            return (None, 0, 0);
        }

        let mut available = self.size - offset;
        if self.points.is_empty() {
            return (None, 0, available);
        }

        let blocksize = self.blocksize;
        let (period_number, phase) = match self.image_period {
            Some(period) if period > 0 => (offset / period, offset % period),
            _ => (0, offset),
        };
        let period_shift = period_number * self.target_period.unwrap_or(0);

        let first = self.points[0].image_offset * blocksize;
        let (point, target_offset) = if phase < first {
            // Before the first point resolution runs backwards.
            let point = &self.points[0];
            available = available.min(first - phase);

            let base = (point.target_offset * blocksize).saturating_sub(first - phase);
            (point, base + period_shift)
        } else {
            let l = self
                .points
                .partition_point(|p| p.image_offset * blocksize <= phase)
                - 1;
            let point = &self.points[l];

            if let Some(next) = self.points.get(l + 1) {
                available = available.min(next.image_offset * blocksize - phase);
            } else if let Some(period) = self.image_period {
                available = available.min(period - phase);
            }

            let base = point.target_offset * blocksize + (phase - point.image_offset * blocksize);
            (point, base + period_shift)
        };

        let target = self
            .targets
            .get(point.target_index as usize)
            .and_then(|t| t.as_ref());

        (target, target_offset, available)
    }

    /// Serialises the points as CSV lines, eliding every point that is
    /// linearly implied by its predecessor on the same target.
    fn to_csv(&self) -> String {
        let mut text = String::new();

        for (i, point) in self.points.iter().enumerate() {
            if i > 0 && point.target_index == self.points[i - 1].target_index {
                let previous = &self.points[i - 1];
                let prediction =
                    previous.target_offset + (point.image_offset - previous.image_offset);

                if prediction == point.target_offset {
                    continue;
                }
            }

            let target = self
                .targets
                .get(point.target_index as usize)
                .and_then(|t| t.as_ref())
                .map(|t| t.to_string())
                .unwrap_or_default();

            text.push_str(&format!(
                "{},{},{}\n",
                point.image_offset, point.target_offset, target
            ));
        }

        text
    }

    /// Parses CSV lines back into points. Malformed lines are logged
    /// and skipped.
    fn parse_csv(&mut self, text: &str) {
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let mut parts = line.splitn(3, ',');
            let image_offset = parts.next().and_then(|v| v.trim().parse::<u64>().ok());
            let target_offset = parts.next().and_then(|v| v.trim().parse::<u64>().ok());
            let target = parts.next().map(str::trim);

            match (image_offset, target_offset, target) {
                (Some(image_offset), Some(target_offset), Some("")) => {
                    self.add_point(image_offset, target_offset, None);
                }
                (Some(image_offset), Some(target_offset), Some(target)) => {
                    match Urn::try_from(target) {
                        Ok(urn) => self.add_point(image_offset, target_offset, Some(&urn)),
                        Err(_) => tracing::warn!(line, "skipping malformed map line"),
                    }
                }
                _ => tracing::warn!(line, "skipping malformed map line"),
            }
        }
    }

    /// Persists the map: the CSV `map` segment in the hosting volume
    /// plus the size, period and blocksize statements.
    pub fn save(&mut self, resolver: &Arc<Resolver>) -> Result<(), Aff4Error> {
        let csv = self.to_csv();

        let mut object = resolver.open(&self.stored, Mode::Write)?;
        let volume = object
            .as_volume()
            .ok_or(Aff4Error::InvalidFormat("hosting volume"))?;

        let segment = self.urn.join("map");
        let result = volume.write_member(
            resolver,
            &segment.to_string(),
            csv.as_bytes(),
            COMPRESSION_DEFLATE,
        );
        resolver.cache_return(object);
        result?;

        resolver.set(&self.urn, AFF4_SIZE, Value::from(self.size));
        if let (Some(image), Some(target)) = (self.image_period, self.target_period) {
            resolver.set(&self.urn, AFF4_IMAGE_PERIOD, Value::from(image));
            resolver.set(&self.urn, AFF4_TARGET_PERIOD, Value::from(target));
        }
        if self.blocksize != 1 {
            resolver.set(&self.urn, AFF4_BLOCKSIZE, Value::from(self.blocksize));
        }
        resolver.set(&self.urn, AFF4_MAP_DATA, Value::Map(self.urn.clone()));

        Ok(())
    }

    fn read_target(
        &self,
        resolver: &Arc<Resolver>,
        target: &Urn,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<(), Aff4Error> {
        let mut object = resolver.open(target, Mode::Read)?;

        let result = (|| -> Result<(), Aff4Error> {
            let stream = object
                .as_stream()
                .ok_or(Aff4Error::InvalidFormat("map target"))?;

            stream.seek(SeekFrom::Start(offset))?;
            stream.read_exact(resolver, buf)
        })();

        resolver.cache_return(object);
        result
    }
}

impl Stream for MapStream {
    fn urn(&self) -> &Urn {
        &self.urn
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn tell(&self) -> u64 {
        self.readptr
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64, Aff4Error> {
        self.readptr = resolve_seek(pos, self.readptr, self.size)?;
        Ok(self.readptr)
    }

    fn read(&mut self, resolver: &Arc<Resolver>, buf: &mut [u8]) -> Result<usize, Aff4Error> {
        let mut produced = 0;

        while produced < buf.len() {
            let (target, target_offset, available) = self.get_range(self.readptr);
            if available == 0 {
                break;
            }

            let n = (available as usize).min(buf.len() - produced);
            let window = &mut buf[produced..produced + n];

            match target {
                None => window.fill(0),
                Some(target) => {
                    let target = target.clone();
                    match self.read_target(resolver, &target, target_offset, window) {
                        Ok(()) => {}
                        Err(e) if self.pad_on_error => {
                            tracing::warn!(%target, error = %e, "padding unreadable map range");
                            window.fill(0);
                        }
                        Err(e) => return Err(e),
                    }
                }
            }

            produced += n;
            self.readptr += n as u64;
        }

        Ok(produced)
    }

    fn write(&mut self, _resolver: &Arc<Resolver>, _buf: &[u8]) -> Result<usize, Aff4Error> {
        Err(Aff4Error::Unsupported(
            "map streams are built from points, not bytes".to_string(),
        ))
    }

    fn close(&mut self, resolver: &Arc<Resolver>) -> Result<(), Aff4Error> {
        if self.closed {
            return Ok(());
        }

        if self.mode == Mode::Write {
            self.save(resolver)?;
        }
        self.closed = true;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn urn(s: &str) -> Urn {
        Urn::try_from(s).unwrap()
    }

    fn sample_map() -> MapStream {
        let resolver = Resolver::new();
        MapStream::create(&resolver, &urn("urn:x:map"), &urn("aff4://vol")).unwrap()
    }

    #[test]
    fn identity_map_resolves_one_to_one() {
        let mut map = sample_map();
        let target = urn("urn:x:target");

        map.add_point(0, 0, Some(&target));
        map.set_size(1000);

        let (resolved, offset, available) = map.get_range(250);
        assert_eq!(resolved, Some(&target));
        assert_eq!(offset, 250);
        assert_eq!(available, 750);
    }

    #[test]
    fn interpolates_backwards_before_first_point() {
        let mut map = sample_map();
        let target = urn("urn:x:target");

        map.add_point(2, 10, Some(&target));
        map.set_size(100);

        let (resolved, offset, available) = map.get_range(0);
        assert_eq!(resolved, Some(&target));
        assert_eq!(offset, 8);
        assert_eq!(available, 2);
    }

    #[test]
    fn raid3_layout_resolves_and_repeats() {
        let mut map = sample_map();
        let (d0, d1, d2) = (urn("urn:x:d0"), urn("urn:x:d1"), urn("urn:x:d2"));
        let block = 65536u64;

        map.set_blocksize(block);
        map.set_periods(6 * block, 3 * block);
        map.add_point(0, 0, Some(&d1));
        map.add_point(1, 0, Some(&d0));
        map.add_point(2, 1, Some(&d2));
        map.add_point(3, 1, Some(&d1));
        map.add_point(4, 2, Some(&d0));
        map.add_point(5, 2, Some(&d2));
        map.set_size(12 * block);

        let (resolved, offset, _) = map.get_range(0);
        assert_eq!(resolved, Some(&d1));
        assert_eq!(offset, 0);

        let (resolved, offset, _) = map.get_range(block);
        assert_eq!(resolved, Some(&d0));
        assert_eq!(offset, 0);

        // One full image period later: same target, shifted by the
        // target period.
        let (resolved, offset, _) = map.get_range(6 * block);
        assert_eq!(resolved, Some(&d1));
        assert_eq!(offset, 3 * block);

        let (resolved, offset, _) = map.get_range(7 * block + 17);
        assert_eq!(resolved, Some(&d0));
        assert_eq!(offset, 3 * block + 17);
    }

    #[test]
    fn sparse_ranges_have_no_target() {
        let mut map = sample_map();
        let target = urn("urn:x:target");

        map.add_point(0, 0, None);
        map.add_point(10, 0, Some(&target));
        map.set_size(100);

        let (resolved, _, available) = map.get_range(3);
        assert_eq!(resolved, None);
        assert_eq!(available, 7);

        let (resolved, offset, _) = map.get_range(15);
        assert_eq!(resolved, Some(&target));
        assert_eq!(offset, 5);
    }

    #[test]
    fn later_point_wins_ties() {
        let mut map = sample_map();
        let (a, b) = (urn("urn:x:a"), urn("urn:x:b"));

        map.add_point(0, 0, Some(&a));
        map.add_point(0, 7, Some(&b));
        map.set_size(10);

        let (resolved, offset, _) = map.get_range(0);
        assert_eq!(resolved, Some(&b));
        assert_eq!(offset, 7);
    }

    #[test]
    fn write_from_appends_runs() {
        let mut map = sample_map();
        let (a, b) = (urn("urn:x:a"), urn("urn:x:b"));

        map.write_from(&a, 100, 50);
        map.write_from(&b, 0, 50);

        assert_eq!(map.size(), 100);

        let (resolved, offset, available) = map.get_range(10);
        assert_eq!(resolved, Some(&a));
        assert_eq!(offset, 110);
        assert_eq!(available, 40);

        let (resolved, offset, _) = map.get_range(60);
        assert_eq!(resolved, Some(&b));
        assert_eq!(offset, 10);
    }

    #[test]
    fn csv_elides_linear_points() {
        let mut map = sample_map();
        let target = urn("urn:x:target");

        map.add_point(0, 0, Some(&target));
        // Linearly implied by the first point.
        map.add_point(10, 10, Some(&target));
        // A jump that must survive.
        map.add_point(20, 100, Some(&target));

        let csv = map.to_csv();
        assert_eq!(csv, "0,0,urn:x:target\n20,100,urn:x:target\n");
    }

    #[test]
    fn csv_round_trip() {
        let mut map = sample_map();
        let (a, b) = (urn("urn:x:a"), urn("urn:x:b"));

        map.add_point(0, 0, Some(&a));
        map.add_point(5, 1000, Some(&b));
        map.add_point(9, 3, None);

        let csv = map.to_csv();

        let mut reparsed = sample_map();
        reparsed.parse_csv(&csv);

        assert_eq!(reparsed.points, map.points);
        assert_eq!(reparsed.to_csv(), csv);
    }

    #[test]
    fn del_removes_point() {
        let mut map = sample_map();
        let target = urn("urn:x:target");

        map.add_point(0, 0, Some(&target));
        map.add_point(10, 50, Some(&target));
        map.del(10);
        map.set_size(100);

        let (_, offset, _) = map.get_range(15);
        assert_eq!(offset, 15);
    }
}
