//! ELF binary analysis
//!
//! Extracts language signals from executables: Go build info, Rust and
//! Python symbols, C++ runtime linkage, PHP version strings and libc
//! flavor. Every probe tolerates non-ELF input by returning a negative
//! result rather than an error, because the executable path taken from
//! `/proc/<pid>/exe` can point at scripts, FIFOs or deleted files.

use goblin::elf::Elf;
use regex::bytes::Regex as BytesRegex;
use regex::Regex;

/// Magic prefix of the `.go.buildinfo` section payload.
const GO_BUILDINFO_MAGIC: &[u8] = b"\xff Go buildinf:";

/// Version strings are stored inline after the header when this flag is set
/// (binaries built with Go 1.18+).
const GO_BUILDINFO_FLAG_INLINE: u8 = 0x2;

pub struct ElfAnalyzer {
    go_version_re: BytesRegex,
    php_version_re: BytesRegex,
    bare_version_re: BytesRegex,
    python_lib_re: Regex,
}

impl Default for ElfAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl ElfAnalyzer {
    pub fn new() -> Self {
        Self {
            go_version_re: BytesRegex::new(r"go1\.\d+(\.\d+)?").unwrap(),
            php_version_re: BytesRegex::new(r"PHP/(\d+\.\d+\.\d+)").unwrap(),
            bare_version_re: BytesRegex::new(r"(\d+\.\d+\.\d+)").unwrap(),
            python_lib_re: Regex::new(r"libpython(\d+\.\d+)").unwrap(),
        }
    }

    fn load(&self, path: &str) -> Option<Vec<u8>> {
        if path.is_empty() {
            return None;
        }
        std::fs::read(path).ok()
    }

    fn section_data<'a>(bytes: &'a [u8], elf: &Elf<'_>, name: &str) -> Option<&'a [u8]> {
        for sh in &elf.section_headers {
            if elf.shdr_strtab.get_at(sh.sh_name) == Some(name) {
                let start = sh.sh_offset as usize;
                let end = start.checked_add(sh.sh_size as usize)?;
                return bytes.get(start..end);
            }
        }
        None
    }

    /// Presence of the embedded Go build-info section, plus the toolchain
    /// version when it can be recovered.
    pub fn go_build_info(&self, path: &str) -> (bool, String) {
        let Some(bytes) = self.load(path) else {
            return (false, String::new());
        };
        let Ok(elf) = Elf::parse(&bytes) else {
            return (false, String::new());
        };
        let Some(section) = Self::section_data(&bytes, &elf, ".go.buildinfo") else {
            return (false, String::new());
        };
        if !section.starts_with(GO_BUILDINFO_MAGIC) {
            return (false, String::new());
        }

        if let Some(version) = parse_inline_go_version(section) {
            return (true, version);
        }

        // Pre-1.18 binaries store the version behind pointers; fall back to
        // the runtime version string that lands in .rodata.
        let haystack = Self::section_data(&bytes, &elf, ".rodata").unwrap_or(&bytes);
        let version = self
            .go_version_re
            .find(haystack)
            .map(|m| String::from_utf8_lossy(m.as_bytes()).into_owned())
            .unwrap_or_default();
        (true, version)
    }

    /// Scan the static and dynamic symbol tables for Rust runtime symbols.
    pub fn has_rust_symbols(&self, path: &str) -> bool {
        let Some(bytes) = self.load(path) else {
            return false;
        };
        let Ok(elf) = Elf::parse(&bytes) else {
            return false;
        };

        for sym in elf.syms.iter() {
            if let Some(name) = elf.strtab.get_at(sym.st_name) {
                if name.contains("__rust_") || (name.contains("_ZN") && name.contains("rust")) {
                    return true;
                }
            }
        }
        for sym in elf.dynsyms.iter() {
            if let Some(name) = elf.dynstrtab.get_at(sym.st_name) {
                if name.contains("__rust_") {
                    return true;
                }
            }
        }
        false
    }

    /// C++ standard library linkage: "gcc" for libstdc++, "llvm" for libc++.
    pub fn cxx_runtime(&self, path: &str) -> Option<&'static str> {
        let bytes = self.load(path)?;
        let elf = Elf::parse(&bytes).ok()?;
        for lib in &elf.libraries {
            if lib.contains("libstdc++") {
                return Some("gcc");
            }
            if lib.contains("libc++") {
                return Some("llvm");
            }
        }
        None
    }

    /// Python interpreter linkage; returns the `maj.min` version when the
    /// library name carries one, `3.x`/`2.x` otherwise.
    pub fn python_linkage(&self, path: &str) -> Option<String> {
        let bytes = self.load(path)?;
        let elf = Elf::parse(&bytes).ok()?;
        for lib in &elf.libraries {
            if let Some(caps) = self.python_lib_re.captures(lib) {
                return Some(caps[1].to_string());
            }
            if lib.contains("libpython3") {
                return Some("3.x".to_string());
            }
            if lib.contains("libpython2") {
                return Some("2.x".to_string());
            }
        }
        None
    }

    /// PHP version from the `.rodata` section (`PHP/x.y.z`, bare `x.y.z`
    /// as fallback).
    pub fn php_version(&self, path: &str) -> Option<String> {
        let bytes = self.load(path)?;
        let elf = Elf::parse(&bytes).ok()?;
        let rodata = Self::section_data(&bytes, &elf, ".rodata")?;
        self.php_version_in(rodata)
    }

    fn php_version_in(&self, data: &[u8]) -> Option<String> {
        if let Some(caps) = self.php_version_re.captures(data) {
            return Some(String::from_utf8_lossy(&caps[1]).into_owned());
        }
        self.bare_version_re
            .captures(data)
            .map(|caps| String::from_utf8_lossy(&caps[1]).into_owned())
    }

    /// Libc flavor from the program interpreter.
    pub fn libc_flavor(&self, path: &str) -> Option<&'static str> {
        let bytes = self.load(path)?;
        let elf = Elf::parse(&bytes).ok()?;
        let interp = elf.interpreter?;
        if interp.contains("musl") {
            Some("musl")
        } else if interp.contains("ld-linux") {
            Some("glibc")
        } else {
            None
        }
    }

    /// DT_NEEDED entries of the binary.
    pub fn imported_libraries(&self, path: &str) -> Vec<String> {
        let Some(bytes) = self.load(path) else {
            return Vec::new();
        };
        let Ok(elf) = Elf::parse(&bytes) else {
            return Vec::new();
        };
        elf.libraries.iter().map(|l| l.to_string()).collect()
    }
}

/// Decode the inline version string of a Go 1.18+ build-info section:
/// 16-byte header (14-byte magic, pointer size, flags) followed at offset 32
/// by a uvarint-prefixed version string.
fn parse_inline_go_version(section: &[u8]) -> Option<String> {
    let flags = *section.get(15)?;
    if flags & GO_BUILDINFO_FLAG_INLINE == 0 {
        return None;
    }
    let rest = section.get(32..)?;
    let (len, read) = read_uvarint(rest)?;
    let version = rest.get(read..read + len as usize)?;
    let version = std::str::from_utf8(version).ok()?;
    if version.is_empty() {
        None
    } else {
        Some(version.to_string())
    }
}

fn read_uvarint(buf: &[u8]) -> Option<(u64, usize)> {
    let mut value = 0u64;
    let mut shift = 0u32;
    for (i, byte) in buf.iter().enumerate() {
        if shift >= 64 {
            return None;
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
        shift += 7;
    }
    None
}
