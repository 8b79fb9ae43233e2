// Model file discovery and ranking.
//
// Uses a lookup table of quantization tags instead of an if-else chain to
// rank candidate files by how compressed they are likely to be.

use std::path::{Path, PathBuf};

use log::debug;
use walkdir::WalkDir;

use llama_desk_types::ModelEntry;

/// Model file extension, matched case-insensitively.
pub const MODEL_EXTENSION: &str = ".gguf";

/// Quantization tags, most preferred first. The first tag contained in the
/// lowercased file name decides the rank, so longer tags precede their
/// prefixes (`q4_k_m` before `q4`).
const QUANT_ORDER: &[&str] = &[
    "q4_k_m", "q4_0", "q4", "q5", "q3", "q6", "q8", "q2", "q1", "int4", "int5", "int8",
];

/// Rank of a file that matches no known tag: after every integer
/// quantization, before the floating point bands.
pub const UNKNOWN_RANK: u32 = 40;
pub const FP16_RANK: u32 = 50;
pub const FP32_RANK: u32 = 60;

/// Preference rank of a lowercased file name. Lower is better.
pub fn quant_rank(file_name_lower: &str) -> u32 {
    if let Some(pos) = QUANT_ORDER
        .iter()
        .position(|tag| file_name_lower.contains(tag))
    {
        return pos as u32;
    }
    if file_name_lower.contains("fp16") || file_name_lower.contains("f16") {
        FP16_RANK
    } else if file_name_lower.contains("fp32") || file_name_lower.contains("f32") {
        FP32_RANK
    } else {
        UNKNOWN_RANK
    }
}

/// A model file found during a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelCandidate {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub file_name_lower: String,
}

impl ModelCandidate {
    /// Total order used for selection: rank, then size, then path bytes.
    fn sort_key(&self) -> (u32, u64, &std::ffi::OsStr) {
        (
            quant_rank(&self.file_name_lower),
            self.size_bytes,
            self.path.as_os_str(),
        )
    }
}

fn is_model_file(name: &str) -> bool {
    name.to_lowercase().ends_with(MODEL_EXTENSION)
}

/// Every model file under `root`, in walk order. A missing root yields
/// nothing; unreadable entries are skipped.
pub fn scan_candidates(root: &Path) -> Vec<ModelCandidate> {
    WalkDir::new(root)
        .follow_links(true)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                debug!("[LOCATOR] Skipping unreadable entry: {e}");
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !is_model_file(&name) {
                return None;
            }
            let size_bytes = entry.metadata().ok()?.len();
            Some(ModelCandidate {
                path: entry.into_path(),
                size_bytes,
                file_name_lower: name.to_lowercase(),
            })
        })
        .collect()
}

/// The preferred model under `root`, or `None` when there is none.
pub fn find_preferred_model(root: &Path) -> Option<PathBuf> {
    let candidates = scan_candidates(root);
    let best = candidates
        .iter()
        .min_by(|a, b| a.sort_key().cmp(&b.sort_key()))?;
    debug!(
        "[LOCATOR] Picked {} out of {} candidates (rank {})",
        best.path.display(),
        candidates.len(),
        quant_rank(&best.file_name_lower)
    );
    Some(best.path.clone())
}

/// All model files under `root`, unranked, ordered by path.
pub fn list_models(root: &Path) -> Vec<ModelEntry> {
    let mut entries: Vec<ModelEntry> = scan_candidates(root)
        .into_iter()
        .map(|candidate| ModelEntry {
            name: candidate
                .path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            path: candidate.path,
        })
        .collect();
    entries.sort_by(|a, b| a.path.cmp(&b.path));
    entries
}
