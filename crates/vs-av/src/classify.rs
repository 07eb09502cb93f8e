//! Stderr-based failure classification.
//!
//! Neither ffmpeg nor the packager report failures in a structured form, so
//! raw [`vs_core::Error::ProcessExecution`] errors are mapped onto the
//! pipeline taxonomy by matching known stderr fragments. The match tables
//! live here and nowhere else; they are heuristic and may need updating when
//! tool versions change their wording.
//!
//! Errors that are not process failures (timeouts, I/O, validation) pass
//! through unchanged.

use vs_core::Error;

const UNSUPPORTED_CODEC_PATTERNS: &[&str] = &[
    "unknown encoder",
    "encoder not found",
    "unsupported codec",
    "codec not currently supported",
    "decoder not found",
    "no such encoder",
    "invalid encoder type",
];

const RESOURCE_PATTERNS: &[&str] = &[
    "out of memory",
    "cannot allocate memory",
    "no space left on device",
    "cuda_error_out_of_memory",
    "openencodesessionex failed",
    "no capable devices found",
    "resource temporarily unavailable",
];

const ENCRYPTION_PATTERNS: &[&str] = &[
    "key_id",
    "invalid key",
    "encryption",
    "protection_scheme",
    "raw key",
];

const MANIFEST_PATTERNS: &[&str] = &["mpd_output", "manifest", "mpd"];

/// Longest stderr excerpt carried into a classified error message.
const MAX_EXCERPT: usize = 500;

/// Reclassify a failed encode.
pub fn classify_transcode_failure(err: Error, codec: &str) -> Error {
    let Error::ProcessExecution {
        ref command,
        exit_code,
        ref stderr,
    } = err
    else {
        return err;
    };
    let lower = stderr.to_ascii_lowercase();
    let excerpt = summarize_stderr(stderr);

    if contains_any(&lower, UNSUPPORTED_CODEC_PATTERNS) {
        Error::UnsupportedVideoCodec {
            codec: codec.to_string(),
            message: excerpt,
        }
    } else if contains_any(&lower, RESOURCE_PATTERNS) {
        Error::InsufficientResources(excerpt)
    } else {
        Error::TranscodingFailed(failure_message(command, exit_code, &excerpt))
    }
}

/// Reclassify a failed packager run.
pub fn classify_package_failure(err: Error) -> Error {
    let Error::ProcessExecution {
        ref command,
        exit_code,
        ref stderr,
    } = err
    else {
        return err;
    };
    let lower = stderr.to_ascii_lowercase();
    let excerpt = summarize_stderr(stderr);

    if contains_any(&lower, ENCRYPTION_PATTERNS) {
        Error::EncryptionSetup(excerpt)
    } else if contains_any(&lower, MANIFEST_PATTERNS) {
        Error::ManifestCreation(excerpt)
    } else {
        Error::PackagingFailed(failure_message(command, exit_code, &excerpt))
    }
}

/// The last few meaningful lines of `stderr`, capped in length.
///
/// ffmpeg prints its banner and stream mapping before the actual error, so
/// the tail is what matters.
pub fn summarize_stderr(stderr: &str) -> String {
    let lines: Vec<&str> = stderr
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    let tail = lines[lines.len().saturating_sub(3)..].join(" | ");
    if tail.len() <= MAX_EXCERPT {
        return tail;
    }
    let mut cut = tail.len() - MAX_EXCERPT;
    while !tail.is_char_boundary(cut) {
        cut += 1;
    }
    format!("...{}", &tail[cut..])
}

/// `"<command> failed (exit code N): <excerpt>"` for unclassified failures.
fn failure_message(command: &str, exit_code: Option<i32>, excerpt: &str) -> String {
    let code = exit_code.map_or_else(|| "none".to_string(), |c| c.to_string());
    format!("{command} failed (exit code {code}): {excerpt}")
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}
