//! Parsing of `/proc/<pid>/maps`.

use std::fs::File;
use std::io::{BufReader, Seek, SeekFrom};

use anyhow::{Context, Result};
use procfs::process::{MMPermissions, MMapPath, MemoryMap, MemoryMaps};
use procfs::FromRead;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapEntry {
    pub start: u64,
    pub end: u64,
    pub offset: u64,
    pub executable: bool,
    /// Empty for anonymous mappings.
    pub path: String,
}

impl MapEntry {
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }

    /// `addr` relative to the start of the mapped file.
    pub fn rel_pc(&self, addr: u64) -> u64 {
        addr - self.start + self.offset
    }
}

fn path_name(path: &MMapPath) -> String {
    match path {
        MMapPath::Path(path) => path.display().to_string(),
        MMapPath::Heap => "[heap]".to_string(),
        MMapPath::Stack => "[stack]".to_string(),
        MMapPath::Vdso => "[vdso]".to_string(),
        MMapPath::Vvar => "[vvar]".to_string(),
        MMapPath::Vsyscall => "[vsyscall]".to_string(),
        MMapPath::Other(name) => name.clone(),
        _ => String::new(),
    }
}

impl From<&MemoryMap> for MapEntry {
    fn from(map: &MemoryMap) -> Self {
        MapEntry {
            start: map.address.0,
            end: map.address.1,
            offset: map.offset,
            executable: map.perms.contains(MMPermissions::EXECUTE),
            path: path_name(&map.pathname),
        }
    }
}

fn collect_maps(maps: MemoryMaps) -> Vec<MapEntry> {
    let mut maps: Vec<MapEntry> = maps.iter().map(MapEntry::from).collect();
    maps.sort_by_key(|m| m.start);
    maps
}

/// Parses the contents of a maps file, sorted by start address.
pub fn parse_maps(content: &str) -> Result<Vec<MapEntry>> {
    let maps = MemoryMaps::from_read(content.as_bytes()).context("Failed to parse maps")?;
    Ok(collect_maps(maps))
}

/// Rereads an already open maps file from the start.
pub fn read_maps(file: &File) -> Result<Vec<MapEntry>> {
    let mut file = file;
    file.seek(SeekFrom::Start(0))?;
    let maps = MemoryMaps::from_read(BufReader::new(file)).context("Failed to read maps")?;
    Ok(collect_maps(maps))
}

pub fn find_map(maps: &[MapEntry], addr: u64) -> Option<&MapEntry> {
    let idx = maps.partition_point(|m| m.start <= addr);
    let map = maps.get(idx.checked_sub(1)?)?;
    map.contains(addr).then_some(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAPS: &str = "\
55d0e4a00000-55d0e4a02000 r--p 00000000 08:01 1234                       /usr/bin/app
55d0e4a02000-55d0e4a08000 r-xp 00002000 08:01 1234                       /usr/bin/app
55d0e5000000-55d0e5021000 rw-p 00000000 00:00 0                          [heap]
7f1c2a000000-7f1c2a021000 rw-p 00000000 00:00 0
7ffd1c9f0000-7ffd1c9f2000 r-xp 00000000 00:00 0                          [vdso]
";

    #[test]
    fn test_parse_maps() {
        let maps = parse_maps(MAPS).unwrap();
        assert_eq!(maps.len(), 5);
        assert_eq!(maps[1].start, 0x55d0e4a02000);
        assert_eq!(maps[1].offset, 0x2000);
        assert!(maps[1].executable);
        assert!(!maps[0].executable);
        assert_eq!(maps[1].path, "/usr/bin/app");
        assert_eq!(maps[2].path, "[heap]");
        assert_eq!(maps[3].path, "");
        assert_eq!(maps[4].path, "[vdso]");
        assert!(maps[4].executable);
    }

    #[test]
    fn test_find_map() {
        let maps = parse_maps(MAPS).unwrap();
        let map = find_map(&maps, 0x55d0e4a02010).unwrap();
        assert_eq!(map.rel_pc(0x55d0e4a02010), 0x2010);
        assert!(find_map(&maps, 0x1000).is_none());
        assert!(find_map(&maps, 0x55d0e4a08000).is_none());
    }

    #[test]
    fn test_bad_line() {
        assert!(parse_maps("garbage").is_err());
    }

    #[test]
    fn test_read_own_maps() {
        let file = File::open("/proc/self/maps").unwrap();
        let first = read_maps(&file).unwrap();
        let second = read_maps(&file).unwrap();
        assert!(!first.is_empty());
        assert!(!second.is_empty());
    }
}
