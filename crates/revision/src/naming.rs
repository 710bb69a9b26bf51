//! Revision names: `<component>-<suffix>`, where the suffix is hyphen-free and
//! strictly increasing within a process.

use std::sync::atomic::{AtomicU64, Ordering};

static LAST: AtomicU64 = AtomicU64::new(0);

fn next_suffix() -> u64 {
    let now = chrono::Utc::now().timestamp_nanos_opt().map(|n| n as u64).unwrap_or(0);
    let mut prev = LAST.load(Ordering::Relaxed);
    loop {
        let next = now.max(prev + 1);
        match LAST.compare_exchange_weak(prev, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(seen) => prev = seen,
        }
    }
}

pub fn construct_revision_name(component: &str) -> String {
    format!("{}-{:x}", component, next_suffix())
}

/// Inverse of [`construct_revision_name`]: strip the last `-` segment.
pub fn extract_component_name(revision: &str) -> &str {
    match revision.rsplit_once('-') {
        Some((component, _)) => component,
        None => revision,
    }
}
