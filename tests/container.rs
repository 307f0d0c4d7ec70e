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

//! End-to-end container scenarios: volumes written, closed, reopened
//! from their bytes alone, and read back through the resolver.

use aff4::config::{ImagerConfig, COMPRESSION_STORED};
use aff4::image::ImageStream;
use aff4::map::MapStream;
use aff4::rdf::{Value, AFF4_CONTAINS, AFF4_SIZE};
use aff4::resolver::{Object, Resolver, Volume};
use aff4::stream::{Mode, Stream};
use aff4::urn::Urn;
use aff4::zip::ZipVolume;

use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;

fn scratch_volume() -> (TempDir, PathBuf, Urn) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("evidence.zip");
    let backing = Urn::from_file_path(&path);

    (dir, path, backing)
}

fn small_config(chunk_size: u32, chunks_in_segment: u32, workers: usize) -> ImagerConfig {
    ImagerConfig {
        chunk_size,
        chunks_in_segment,
        workers,
        ..ImagerConfig::default()
    }
}

/// Reads `[start, start + len)` from a stream object.
fn read_range(
    resolver: &Arc<Resolver>,
    stream: &mut dyn Stream,
    start: u64,
    len: usize,
) -> Vec<u8> {
    stream.seek(SeekFrom::Start(start)).unwrap();
    let mut buf = vec![0; len];
    stream.read_exact(resolver, &mut buf).unwrap();

    buf
}

#[test]
fn tiny_image_round_trip() {
    let (_dir, _path, backing) = scratch_volume();
    let resolver = Arc::new(Resolver::new());
    let volume_urn = Urn::try_from("aff4://tiny-image").unwrap();

    let mut volume = ZipVolume::create(&resolver, Some(volume_urn.clone()), &backing).unwrap();
    let image_urn = volume_urn.join("img");

    let mut image = ImageStream::create(
        &resolver,
        &image_urn,
        &volume_urn,
        &small_config(4, 2, 2),
    )
    .unwrap();
    image.write_all(&resolver, b"ABCDEFGHIJ").unwrap();
    image.close(&resolver).unwrap();
    volume.close(&resolver).unwrap();

    // Reopen from the container bytes alone.
    let resolver = Arc::new(Resolver::new());
    let mut volume = ZipVolume::open_file(&resolver, &backing, Mode::Read).unwrap();
    assert_eq!(volume.urn(), &volume_urn);

    // 10 bytes in 4-byte chunks, 2 chunks per bevy: a full bevy and a
    // short one, each with data and index segments.
    for name in [
        "img/00000000",
        "img/00000000.idx",
        "img/00000001",
        "img/00000001.idx",
    ] {
        let member = volume.member_urn(name);
        assert!(
            resolver.resolve_integer(&member, AFF4_SIZE).is_ok(),
            "missing segment {name}"
        );
    }

    // The full bevy indexes two chunks plus the terminator.
    let index_member = volume.member_urn("img/00000000.idx");
    let index = volume.read_member(&resolver, &index_member).unwrap();
    assert_eq!(index.len(), 12);
    assert_eq!(u32::from_le_bytes(index[..4].try_into().unwrap()), 0);

    let mut image = resolver.open(&image_urn, Mode::Read).unwrap();
    let stream = image.as_stream().unwrap();
    assert_eq!(stream.size(), 10);
    assert_eq!(read_range(&resolver, stream, 3, 6), b"DEFGHI");
}

#[test]
fn image_random_access_matches_source() {
    let (_dir, _path, backing) = scratch_volume();
    let resolver = Arc::new(Resolver::new());

    let mut volume = ZipVolume::create(&resolver, None, &backing).unwrap();
    let volume_urn = volume.urn().clone();
    let image_urn = volume_urn.join("disk");

    let mut rng = StdRng::seed_from_u64(0x4146_4634);
    let mut content = vec![0u8; 1 << 20];
    rng.fill(content.as_mut_slice());

    let mut image = ImageStream::create(
        &resolver,
        &image_urn,
        &volume_urn,
        &small_config(4096, 8, 3),
    )
    .unwrap();

    // Feed in uneven slices so bevy boundaries never line up with the
    // write calls.
    for piece in content.chunks(37_001) {
        image.write_all(&resolver, piece).unwrap();
    }
    image.close(&resolver).unwrap();
    volume.close(&resolver).unwrap();

    let mut image = resolver.open(&image_urn, Mode::Read).unwrap();
    let stream = image.as_stream().unwrap();

    assert_eq!(
        read_range(&resolver, stream, 0, content.len()),
        content,
        "full read differs"
    );

    for _ in 0..20 {
        let start = rng.gen_range(0..content.len() as u64);
        let len = rng.gen_range(0..=(content.len() as u64 - start)) as usize;

        assert_eq!(
            read_range(&resolver, stream, start, len),
            &content[start as usize..start as usize + len],
            "slice [{start}, {start}+{len}) differs"
        );
    }
}

#[test]
fn manifest_persists_free_statements() {
    let (_dir, _path, backing) = scratch_volume();
    let resolver = Arc::new(Resolver::new());

    let mut volume = ZipVolume::create(&resolver, None, &backing).unwrap();
    let subject = Urn::try_from("urn:x:a").unwrap();

    resolver.add(&subject, "aff4:exhibit", Value::Integer(1), false);
    resolver.add(&subject, "aff4:exhibit", Value::Integer(2), false);
    volume.close(&resolver).unwrap();

    let resolver = Arc::new(Resolver::new());
    ZipVolume::open_file(&resolver, &backing, Mode::Read).unwrap();

    assert_eq!(
        resolver.resolve_list(&subject, "aff4:exhibit"),
        vec![Value::Integer(1), Value::Integer(2)]
    );
}

#[test]
fn duplicate_member_reads_latest_after_reopen() {
    let (_dir, _path, backing) = scratch_volume();
    let resolver = Arc::new(Resolver::new());

    let mut volume = ZipVolume::create(&resolver, None, &backing).unwrap();
    volume
        .write_member(&resolver, "hello", b"v1", COMPRESSION_STORED)
        .unwrap();
    volume
        .write_member(&resolver, "hello", b"v2", COMPRESSION_STORED)
        .unwrap();
    volume.close(&resolver).unwrap();

    let resolver = Arc::new(Resolver::new());
    let mut volume = ZipVolume::open_file(&resolver, &backing, Mode::Read).unwrap();
    let member = volume.member_urn("hello");

    assert_eq!(volume.read_member(&resolver, &member).unwrap(), b"v2");
}

#[test]
fn raid_map_resolves_across_periods() {
    let (_dir, _path, backing) = scratch_volume();
    let resolver = Arc::new(Resolver::new());
    let block = 65536usize;

    let mut volume = ZipVolume::create(&resolver, None, &backing).unwrap();
    let volume_urn = volume.urn().clone();

    // Three "disks" of six blocks each; block j of disk i is filled
    // with the byte 0x10 * i + j.
    let mut disks = Vec::new();
    for i in 0..3u8 {
        let content: Vec<u8> = (0..6u8)
            .flat_map(|j| std::iter::repeat(0x10 * i + j).take(block))
            .collect();
        let member = volume
            .write_member(
                &resolver,
                &format!("d{i}"),
                &content,
                COMPRESSION_STORED,
            )
            .unwrap();
        disks.push(member);
    }

    let map_urn = volume_urn.join("raid");
    let mut map = MapStream::create(&resolver, &map_urn, &volume_urn).unwrap();
    map.set_blocksize(block as u64);
    map.set_periods(6 * block as u64, 3 * block as u64);
    map.set_size(12 * block as u64);

    // Left-symmetric rotation: data blocks skip the parity block.
    map.add_point(0, 0, Some(&disks[1]));
    map.add_point(1, 0, Some(&disks[0]));
    map.add_point(2, 1, Some(&disks[2]));
    map.add_point(3, 1, Some(&disks[1]));
    map.add_point(4, 2, Some(&disks[0]));
    map.add_point(5, 2, Some(&disks[2]));

    map.close(&resolver).unwrap();
    volume.close(&resolver).unwrap();

    // Reopen and resolve through the persisted map.
    let resolver = Arc::new(Resolver::new());
    ZipVolume::open_file(&resolver, &backing, Mode::Read).unwrap();

    let mut map = resolver.open(&map_urn, Mode::Read).unwrap();
    let stream = map.as_stream().unwrap();
    assert_eq!(stream.size(), 12 * block as u64);

    // Logical block 0 is disk 1 block 0, logical block 1 is disk 0
    // block 0.
    assert_eq!(read_range(&resolver, stream, 0, 4), vec![0x10; 4]);
    assert_eq!(read_range(&resolver, stream, block as u64, 4), vec![0x00; 4]);

    // One image period later the same disk serves, one target period
    // deeper: disk 1 block 3.
    assert_eq!(
        read_range(&resolver, stream, 6 * block as u64, 4),
        vec![0x13; 4]
    );

    // An unaligned probe in the second period: logical block 7 is disk
    // 0 block 3.
    assert_eq!(
        read_range(&resolver, stream, 7 * block as u64 + 123, 4),
        vec![0x03; 4]
    );
}

#[test]
fn bevies_appear_in_order_under_saturation() {
    let (_dir, _path, backing) = scratch_volume();
    let resolver = Arc::new(Resolver::new());

    let mut volume = ZipVolume::create(&resolver, None, &backing).unwrap();
    let volume_urn = volume.urn().clone();
    let image_urn = volume_urn.join("img");

    let mut image = ImageStream::create(
        &resolver,
        &image_urn,
        &volume_urn,
        &small_config(1 << 20, 1, 2),
    )
    .unwrap();

    let mut content = vec![0u8; 64 << 20];
    for (i, byte) in content.iter_mut().enumerate() {
        *byte = (i % 251) as u8;
    }

    image.write_all(&resolver, &content).unwrap();
    image.close(&resolver).unwrap();
    volume.close(&resolver).unwrap();

    let resolver = Arc::new(Resolver::new());
    let volume = ZipVolume::open_file(&resolver, &backing, Mode::Read).unwrap();

    // Bevy data segments must sit in the central directory in
    // ascending bevy-id order.
    let prefix = format!("{}/", image_urn);
    let mut bevy_ids = Vec::new();
    for value in resolver.resolve_list(volume.urn(), AFF4_CONTAINS) {
        let Value::Urn(member) = value else { continue };
        let name = member.to_string();
        if let Some(tail) = name.strip_prefix(&prefix) {
            if tail.len() == 8 {
                bevy_ids.push(u64::from_str_radix(tail, 16).unwrap());
            }
        }
    }

    assert_eq!(bevy_ids.len(), 64);
    assert!(
        bevy_ids.windows(2).all(|w| w[0] < w[1]),
        "bevy order scrambled: {bevy_ids:?}"
    );

    let mut image = resolver.open(&image_urn, Mode::Read).unwrap();
    let stream = image.as_stream().unwrap();
    assert_eq!(read_range(&resolver, stream, 0, content.len()), content);
}

#[test]
fn link_aliases_survive_reopen() {
    let (_dir, _path, backing) = scratch_volume();
    let resolver = Arc::new(Resolver::new());

    let mut volume = ZipVolume::create(&resolver, None, &backing).unwrap();
    let member = volume
        .write_member(&resolver, "payload", b"linked data", COMPRESSION_STORED)
        .unwrap();

    let alias = Urn::try_from("urn:x:alias").unwrap();
    resolver.add_link(&alias, &member);
    volume.close(&resolver).unwrap();

    let resolver = Arc::new(Resolver::new());
    ZipVolume::open_file(&resolver, &backing, Mode::Read).unwrap();

    let mut object = resolver.open(&alias, Mode::Read).unwrap();
    let stream = object.as_stream().unwrap();
    assert_eq!(read_range(&resolver, stream, 0, 11), b"linked data");
}

// Writes a member crossing the classical Zip limit. Expensive: the
// volume grows past 2 GiB on disk.
#[test]
#[ignore = "writes a 2 GiB volume"]
fn zip64_member_crosses_the_limit() {
    let (_dir, _path, backing) = scratch_volume();
    let resolver = Arc::new(Resolver::new());
    let total: u64 = 1 << 31;

    let mut volume = ZipVolume::create(&resolver, None, &backing).unwrap();
    let mut writer = volume
        .open_member_w(&resolver, "big", COMPRESSION_STORED)
        .unwrap();

    let slab = vec![0xAAu8; 1 << 20];
    let mut written = 0;
    while written < total {
        writer.write(&slab).unwrap();
        written += slab.len() as u64;
    }
    writer.close(&resolver).unwrap();

    Volume::close(&mut volume, &resolver).unwrap();

    let resolver = Arc::new(Resolver::new());
    let volume = ZipVolume::open_file(&resolver, &backing, Mode::Read).unwrap();
    let member = volume.member_urn("big");

    assert_eq!(
        resolver.resolve_integer(&member, AFF4_SIZE).unwrap(),
        2_147_483_648
    );

    let mut stream = volume.open_member_r(&resolver, "big").unwrap();
    let mut buf = [0u8; 16];
    stream.read_exact(&resolver, &mut buf).unwrap();
    assert_eq!(buf, [0xAA; 16]);
}

#[test]
fn wrong_mode_object_is_rebuilt() {
    let (_dir, path, backing) = scratch_volume();
    std::fs::write(&path, b"plain bytes").unwrap();

    let resolver = Arc::new(Resolver::new());
    let object = resolver.open(&backing, Mode::Read).unwrap();
    resolver.cache_return(object);

    let mut object = resolver.open(&backing, Mode::Write).unwrap();
    match &mut object {
        Object::File(file) => assert_eq!(file.mode(), Mode::Write),
        _ => panic!("expected a file stream"),
    }
}
