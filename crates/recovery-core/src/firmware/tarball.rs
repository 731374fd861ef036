use crate::error::{RecoveryError, Result};
use crate::tlw::Runner;
use std::collections::HashSet;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const EXTRACT_TIMEOUT: Duration = Duration::from_secs(300);

/// Extract the first candidate present in `tarball` into `dest_dir`.
///
/// Candidates are ordered most specific first; the first one the tarball
/// lists and that extracts cleanly wins. Returns the path of the extracted
/// file.
pub async fn extract_from_tarball(
    runner: &dyn Runner,
    cancel: &CancellationToken,
    tarball: &str,
    dest_dir: &str,
    candidates: &[String],
) -> Result<String> {
    runner
        .run(cancel, EXTRACT_TIMEOUT, "mkdir", &["-p", dest_dir])
        .await
        .map_err(|e| e.context(format!("create {dest_dir}")))?;

    let mut list_args = vec!["tf", tarball];
    list_args.extend(candidates.iter().map(String::as_str));
    // tar exits non-zero when some names are missing but still lists the rest.
    let listing = match runner.run(cancel, EXTRACT_TIMEOUT, "tar", &list_args).await {
        Ok(out) => out,
        Err(RecoveryError::RemoteExec {
            exit_code, stdout, ..
        }) => {
            tracing::debug!(tarball, exit_code, "not all candidates listed");
            stdout
        }
        Err(e) => return Err(e),
    };
    let present: HashSet<&str> = listing.lines().map(str::trim).collect();

    for candidate in candidates {
        if !present.contains(candidate.as_str()) {
            continue;
        }
        match runner
            .run(
                cancel,
                EXTRACT_TIMEOUT,
                "tar",
                &["xf", tarball, "-C", dest_dir, candidate],
            )
            .await
        {
            Ok(_) => {
                tracing::debug!(candidate = %candidate, "extracted from tarball");
                return Ok(join_remote(dest_dir, candidate));
            }
            Err(RecoveryError::Cancelled) => return Err(RecoveryError::Cancelled),
            Err(e) => tracing::debug!(candidate = %candidate, error = %e, "extract failed"),
        }
    }
    Err(RecoveryError::failed(format!(
        "extract from {tarball}: none of {candidates:?} found"
    )))
}

pub(crate) fn join_remote(dir: &str, name: &str) -> String {
    format!("{}/{}", dir.trim_end_matches('/'), name)
}

/// `ec_board` is the board servod reports for the EC, lowercased, or empty.
pub(crate) fn ec_candidates(model: &str, ec_board: &str, board: &str) -> Vec<String> {
    let mut out = vec![format!("{model}/ec.bin")];
    // dragonair ships its EC under the dratini directory.
    if model == "dragonair" {
        out.push("dratini/ec.bin".to_string());
    }
    if !ec_board.is_empty() {
        out.push(format!("{ec_board}/ec.bin"));
    }
    out.push(format!("{board}/ec.bin"));
    out.push("ec.bin".to_string());
    out
}

pub(crate) fn ap_candidates(model: &str, ec_board: &str, board: &str) -> Vec<String> {
    let mut out = vec![format!("image-{model}.bin")];
    if !ec_board.is_empty() {
        out.push(format!("image-{ec_board}.bin"));
    }
    out.push(format!("image-{board}.bin"));
    out.push("image.bin".to_string());
    out
}

/// Extract the EC image, then try the sibling monitor file.
pub async fn extract_ec_image(
    runner: &dyn Runner,
    cancel: &CancellationToken,
    tarball: &str,
    dest_dir: &str,
    candidates: &[String],
) -> Result<String> {
    let image = extract_from_tarball(runner, cancel, tarball, dest_dir, candidates)
        .await
        .map_err(|e| e.context("extract ec image"))?;
    let monitors: Vec<String> = candidates
        .iter()
        .map(|c| c.replace("ec.bin", "npcx_monitor.bin"))
        .collect();
    match extract_from_tarball(runner, cancel, tarball, dest_dir, &monitors).await {
        Ok(path) => tracing::debug!(path = %path, "extracted ec monitor"),
        Err(RecoveryError::Cancelled) => return Err(RecoveryError::Cancelled),
        Err(e) => tracing::debug!(error = %e, "no ec monitor in tarball"),
    }
    Ok(image)
}
