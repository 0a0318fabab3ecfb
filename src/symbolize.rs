use std::collections::HashMap;
use std::path::Path;

use blazesym::helper::read_elf_build_id;
use blazesym::symbolize::source::{Kernel, Process, Source};
use blazesym::symbolize::{Input, Sym, Symbolized, Symbolizer};
use blazesym::Pid;
use tracing::debug;

use crate::sample::FrameData;

pub const KERNEL_MAP_NAME: &str = "[kernel.kallsyms]";

/// Resolves function names for unwound frames. Lives on the unwinder thread.
pub struct FrameSymbolizer {
    symbolizer: Symbolizer,
    /// Kernel symbols don't go stale with processes, so they get their own symbolizer that cache
    /// clears leave alone.
    kernel_symbolizer: Symbolizer,
    /// Built on first use, kept across cache clears.
    kernel_src: Option<Source<'static>>,
    build_ids: HashMap<(i32, String), String>,
}

impl Default for FrameSymbolizer {
    fn default() -> Self {
        Self::new()
    }
}

fn symbol_name(sym: Symbolized<'_>) -> Option<String> {
    match sym {
        Symbolized::Sym(Sym { name, .. }) => Some(name.to_string()),
        Symbolized::Unknown(_) => None,
    }
}

impl FrameSymbolizer {
    pub fn new() -> Self {
        FrameSymbolizer {
            symbolizer: Symbolizer::new(),
            kernel_symbolizer: Symbolizer::new(),
            kernel_src: None,
            build_ids: HashMap::new(),
        }
    }

    /// Names for the absolute userspace addresses `pcs` of `pid`, `None` where unknown.
    pub fn symbolize_user(&mut self, pid: i32, pcs: &[u64]) -> Vec<Option<String>> {
        if pcs.is_empty() {
            return Vec::new();
        }
        let src = Source::Process(Process::new(Pid::from(pid as u32)));
        match self.symbolizer.symbolize(&src, Input::AbsAddr(pcs)) {
            Ok(syms) => syms.into_iter().map(symbol_name).collect(),
            Err(e) => {
                debug!("Failed to symbolize {} frames of pid {pid}: {e}", pcs.len());
                vec![None; pcs.len()]
            }
        }
    }

    /// Frames for a kernel callchain, in the order given.
    pub fn kernel_frames(&mut self, ips: &[u64]) -> Vec<FrameData> {
        if ips.is_empty() {
            return Vec::new();
        }
        let src = self
            .kernel_src
            .get_or_insert_with(|| Source::Kernel(Kernel::default()));
        let names = match self.kernel_symbolizer.symbolize(src, Input::AbsAddr(ips)) {
            Ok(syms) => syms.into_iter().map(symbol_name).collect(),
            Err(e) => {
                debug!("Failed to symbolize kernel frames: {e}");
                vec![None; ips.len()]
            }
        };
        ips.iter()
            .zip(names)
            .map(|(ip, name)| FrameData {
                function_name: name.unwrap_or_default(),
                map_name: KERNEL_MAP_NAME.to_string(),
                rel_pc: *ip,
                ..Default::default()
            })
            .collect()
    }

    /// Lowercase hex build id of the file mapped at `path` in `pid`, empty if there is none.
    pub fn build_id(&mut self, pid: i32, path: &str) -> String {
        if path.is_empty() || path.starts_with('[') {
            return String::new();
        }
        let key = (pid, path.to_string());
        if let Some(id) = self.build_ids.get(&key) {
            return id.clone();
        }
        // Go through the process' root so paths resolve inside its mount namespace.
        let rooted = format!("/proc/{pid}/root{path}");
        let id = match read_elf_build_id(Path::new(&rooted)) {
            Ok(Some(bytes)) => bytes.iter().map(|b| format!("{b:02x}")).collect(),
            Ok(None) => String::new(),
            Err(e) => {
                debug!("Failed to read build id of {path}: {e}");
                String::new()
            }
        };
        self.build_ids.insert(key, id.clone());
        id
    }

    /// Drops everything cached about userspace processes. Kernel symbol data survives.
    pub fn clear_cached_state(&mut self) {
        self.symbolizer = Symbolizer::new();
        self.build_ids.clear();
    }
}
