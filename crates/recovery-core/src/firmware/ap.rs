use super::gbb::gbb_to_int;
use super::tarball::{ap_candidates, ec_candidates, extract_ec_image, extract_from_tarball, join_remote};
use super::with_programmer;
use crate::error::{RecoveryError, Result};
use crate::servo::get_string;
use crate::tlw::{Runner, Servod};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const READ_TIMEOUT: Duration = Duration::from_secs(30);
const DIR_TIMEOUT: Duration = Duration::from_secs(60);
const DOWNLOAD_FILENAME: &str = "fw_image.tar.bz2";

/// Signature key hash prefix of the developer keys.
const DEV_KEY_PREFIX: &str = "b11d";

// ---------------------------------------------------------------------------
// Read AP info
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct ReadApInfoRequest {
    /// Where the AP image is extracted on the servo host.
    pub file_path: String,
    pub force_extract: bool,
    pub gbb_flags: bool,
    pub keys: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApInfo {
    pub gbb_flags_raw: String,
    pub gbb_flags: u64,
    pub keys: Vec<String>,
}

/// Extract the AP through the servo and read GBB flags and signing keys.
pub async fn read_ap_info(
    runner: Arc<dyn Runner>,
    servod: Arc<dyn Servod>,
    cancel: CancellationToken,
    req: &ReadApInfoRequest,
) -> Result<ApInfo> {
    let path = req.file_path.clone();
    let force = req.force_extract;
    with_programmer(runner.clone(), servod, cancel.clone(), |p| {
        Box::pin(async move { p.extract_ap(&path, force).await })
    })
    .await
    .map_err(|e| e.context("read ap info"))?;

    let mut info = ApInfo::default();
    if req.gbb_flags {
        let out = runner
            .run(&cancel, READ_TIMEOUT, "gbb_utility", &["--get", "--flags", &req.file_path])
            .await
            .map_err(|e| e.context("read ap info"))?;
        info.gbb_flags_raw = parse_gbb_output(&out)?;
        info.gbb_flags = gbb_to_int(&info.gbb_flags_raw)?;
        tracing::debug!(gbb = %info.gbb_flags_raw, "read gbb flags");
    }
    if req.keys {
        let out = runner
            .run(&cancel, READ_TIMEOUT, "futility", &["show", &req.file_path])
            .await
            .map_err(|e| e.context("read ap info"))?;
        info.keys = parse_key_hashes(&out);
        tracing::debug!(keys = ?info.keys, "read ap keys");
    }
    Ok(info)
}

/// `flags: 0x00000039` -> `0x00000039`.
fn parse_gbb_output(out: &str) -> Result<String> {
    match out.split_once(':') {
        Some((_, value)) => Ok(value.trim().to_string()),
        None => Err(RecoveryError::failed(format!(
            "read ap info: unexpected gbb output {out:?}"
        ))),
    }
}

fn parse_key_hashes(out: &str) -> Vec<String> {
    out.lines()
        .filter(|line| line.contains("Key sha1sum:"))
        .filter_map(|line| line.split_whitespace().nth(2))
        .map(str::to_string)
        .collect()
}

pub fn is_dev_keys(keys: &[String]) -> bool {
    keys.iter().any(|k| {
        let dev = k.starts_with(DEV_KEY_PREFIX);
        if dev {
            tracing::debug!(key = %k, "found dev signed key");
        }
        dev
    })
}

// ---------------------------------------------------------------------------
// Set AP info
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct SetApInfoRequest {
    pub file_path: String,
    pub force_extract: bool,
    /// GBB flags to flash, e.g. `0x18`.
    pub gbb_flags: String,
}

/// Extract the AP and flash it back with new GBB flags.
pub async fn set_ap_info(
    runner: Arc<dyn Runner>,
    servod: Arc<dyn Servod>,
    cancel: CancellationToken,
    req: &SetApInfoRequest,
) -> Result<()> {
    // Reject bad input before touching the servo.
    gbb_to_int(&req.gbb_flags)?;
    let req = req.clone();
    with_programmer(runner, servod, cancel, |p| {
        Box::pin(async move {
            p.extract_ap(&req.file_path, req.force_extract).await?;
            p.program_ap(&req.file_path, Some(req.gbb_flags.as_str())).await
        })
    })
    .await
    .map_err(|e| e.context("set ap info"))
}

// ---------------------------------------------------------------------------
// Install firmware from a firmware image tarball
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct InstallFwFromFwImageRequest {
    pub board: String,
    pub model: String,
    /// Scratch directory on the servo host; wiped before and after.
    pub download_dir: String,
    pub image_url: String,
    pub download_timeout: Duration,
    pub update_ec: bool,
    pub update_ap: bool,
    pub gbb_flags: Option<String>,
}

pub async fn install_fw_from_fw_image(
    runner: Arc<dyn Runner>,
    servod: Arc<dyn Servod>,
    cancel: CancellationToken,
    req: &InstallFwFromFwImageRequest,
) -> Result<()> {
    if req.board.is_empty() || req.model.is_empty() {
        return Err(RecoveryError::usage(
            "install fw from fw-image: request missed board/model data",
        ));
    }
    if !req.update_ec && !req.update_ap {
        return Err(RecoveryError::usage(
            "install fw from fw-image: at least ec or ap update need to be requested",
        ));
    }
    if let Some(gbb) = &req.gbb_flags {
        gbb_to_int(gbb)?;
    }

    clear_directory(runner.as_ref(), &cancel, &req.download_dir).await;
    runner
        .run(&cancel, DIR_TIMEOUT, "mkdir", &["-p", &req.download_dir])
        .await
        .map_err(|e| e.context("install fw from fw-image"))?;
    let result = install_from_dir(runner.clone(), servod, cancel.clone(), req).await;
    // The servo host has little storage to spare.
    clear_directory(runner.as_ref(), &cancel, &req.download_dir).await;
    result.map_err(|e| e.context("install fw from fw-image"))
}

async fn clear_directory(runner: &dyn Runner, cancel: &CancellationToken, dir: &str) {
    if let Err(e) = runner.run(cancel, DIR_TIMEOUT, "rm", &["-rf", dir]).await {
        tracing::debug!(dir, error = %e, "failed to remove download directory");
    }
}

async fn install_from_dir(
    runner: Arc<dyn Runner>,
    servod: Arc<dyn Servod>,
    cancel: CancellationToken,
    req: &InstallFwFromFwImageRequest,
) -> Result<()> {
    let tarball = join_remote(&req.download_dir, DOWNLOAD_FILENAME);
    runner
        .run(
            &cancel,
            req.download_timeout,
            "curl",
            &[&req.image_url, "--output", &tarball],
        )
        .await?;
    tracing::info!(tarball = %tarball, url = %req.image_url, "downloaded firmware image");

    let ec_board = match get_string(servod.as_ref(), &cancel, "ec_board").await {
        Ok(board) => board.to_lowercase(),
        Err(e) => {
            tracing::debug!(error = %e, "cannot read ec_board from servod");
            String::new()
        }
    };
    let req = req.clone();
    let extract_runner = runner.clone();
    with_programmer(runner, servod, cancel.clone(), |p| {
        Box::pin(async move {
            if req.update_ec {
                let dest = join_remote(&req.download_dir, "EC");
                let candidates = ec_candidates(&req.model, &ec_board, &req.board);
                let image =
                    extract_ec_image(extract_runner.as_ref(), &cancel, &tarball, &dest, &candidates)
                        .await?;
                p.program_ec(&image).await?;
                tracing::info!(image = %image, "finished program ec");
            }
            if req.update_ap {
                let dest = join_remote(&req.download_dir, "AP");
                let candidates = ap_candidates(&req.model, &ec_board, &req.board);
                let image = extract_from_tarball(
                    extract_runner.as_ref(),
                    &cancel,
                    &tarball,
                    &dest,
                    &candidates,
                )
                .await
                .map_err(|e| e.context("extract ap image"))?;
                p.program_ap(&image, req.gbb_flags.as_deref()).await?;
                tracing::info!(image = %image, "finished program ap");
            }
            Ok(())
        })
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeRunner, FakeServod, Reply};

    const FUTILITY_SHOW: &str = "\
Public Key file:       /tmp/ap.bin
  Vblock:
    Key sha1sum:       b11d74edd286c144e1135b49e7f0bc20cf041f10
  Kernel key:
    Key sha1sum:       d6170aa480136f1f29cf339a5ab1b960585fa444
";

    fn ccd_servod() -> Arc<FakeServod> {
        FakeServod::new()
            .with("servo_type", "servo_v4_with_ccd_cr50")
            .with("ccd_serialname", "CCD1")
            .with("ec_chip", "npcx_uut")
            .with("ec_board", "Hatch")
    }

    #[test]
    fn key_hashes_take_third_field() {
        assert_eq!(
            parse_key_hashes(FUTILITY_SHOW),
            vec![
                "b11d74edd286c144e1135b49e7f0bc20cf041f10".to_string(),
                "d6170aa480136f1f29cf339a5ab1b960585fa444".to_string(),
            ]
        );
    }

    #[test]
    fn dev_keys_detected_by_prefix() {
        assert!(is_dev_keys(&["b11d00".to_string()]));
        assert!(!is_dev_keys(&["d617".to_string(), "aaaa".to_string()]));
        assert!(!is_dev_keys(&[]));
    }

    #[tokio::test]
    async fn read_ap_info_reports_flags_and_keys() {
        let runner = FakeRunner::new();
        runner
            .on("gbb_utility --get --flags", Reply::ok("flags: 0x00000039"))
            .on("futility show", Reply::ok(FUTILITY_SHOW));
        let req = ReadApInfoRequest {
            file_path: "/tmp/ap.bin".into(),
            force_extract: true,
            gbb_flags: true,
            keys: true,
        };
        let info = read_ap_info(runner.clone(), ccd_servod(), CancellationToken::new(), &req)
            .await
            .unwrap();
        assert_eq!(info.gbb_flags, 57);
        assert_eq!(info.gbb_flags_raw, "0x00000039");
        assert_eq!(info.keys.len(), 2);
        assert!(runner.called("flashrom -p raiden_debug_spi:target=AP,serial=CCD1 -r /tmp/ap.bin"));
    }

    #[tokio::test]
    async fn set_ap_info_rejects_bad_gbb_before_flashing() {
        let runner = FakeRunner::new();
        let req = SetApInfoRequest {
            file_path: "/tmp/ap.bin".into(),
            force_extract: false,
            gbb_flags: "raw".into(),
        };
        let err = set_ap_info(runner.clone(), ccd_servod(), CancellationToken::new(), &req)
            .await
            .unwrap_err();
        assert!(matches!(err, RecoveryError::Usage(_)));
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn set_ap_info_flashes_extracted_image() {
        let runner = FakeRunner::new();
        let req = SetApInfoRequest {
            file_path: "/tmp/ap.bin".into(),
            force_extract: false,
            gbb_flags: "0x18".into(),
        };
        set_ap_info(runner.clone(), ccd_servod(), CancellationToken::new(), &req)
            .await
            .unwrap();
        assert!(runner.called("futility update -i /tmp/ap.bin --servo_port=9999 --gbb_flags=24"));
    }

    fn install_request() -> InstallFwFromFwImageRequest {
        InstallFwFromFwImageRequest {
            board: "hatch".into(),
            model: "kohaku".into(),
            download_dir: "/tmp/fw".into(),
            image_url: "http://cache/fw.tar.bz2".into(),
            download_timeout: Duration::from_secs(600),
            update_ec: true,
            update_ap: true,
            gbb_flags: None,
        }
    }

    #[tokio::test]
    async fn install_requires_board_model_and_target() {
        let mut req = install_request();
        req.model.clear();
        let err = install_fw_from_fw_image(FakeRunner::new(), ccd_servod(), CancellationToken::new(), &req)
            .await
            .unwrap_err();
        assert!(matches!(err, RecoveryError::Usage(_)));
        let mut req = install_request();
        req.update_ec = false;
        req.update_ap = false;
        assert!(install_fw_from_fw_image(FakeRunner::new(), ccd_servod(), CancellationToken::new(), &req)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn install_programs_ec_then_ap_and_cleans_up() {
        let runner = FakeRunner::new();
        runner
            .on("tar tf /tmp/fw/fw_image.tar.bz2 kohaku/ec.bin", Reply::ok("hatch/ec.bin"))
            .on("tar tf /tmp/fw/fw_image.tar.bz2 image-kohaku.bin", Reply::ok("image-hatch.bin"));
        install_fw_from_fw_image(runner.clone(), ccd_servod(), CancellationToken::new(), &install_request())
            .await
            .unwrap();
        let calls = runner.calls();
        assert_eq!(calls.first().map(String::as_str), Some("rm -rf /tmp/fw"));
        assert_eq!(calls.last().map(String::as_str), Some("rm -rf /tmp/fw"));
        assert!(runner.called("curl http://cache/fw.tar.bz2 --output /tmp/fw/fw_image.tar.bz2"));
        let ec = calls.iter().position(|c| c.starts_with("flash_ec")).unwrap();
        let ap = calls.iter().position(|c| c.starts_with("futility update")).unwrap();
        assert!(ec < ap);
        assert!(runner.called("flash_ec --chip=npcx_uut --image=/tmp/fw/EC/hatch/ec.bin"));
        assert!(runner.called("futility update -i /tmp/fw/AP/image-hatch.bin"));
    }

    #[tokio::test]
    async fn install_cleans_up_after_download_failure() {
        let runner = FakeRunner::new();
        runner.on("curl", Reply::fail(22));
        assert!(install_fw_from_fw_image(runner.clone(), ccd_servod(), CancellationToken::new(), &install_request())
            .await
            .is_err());
        assert_eq!(runner.calls().last().map(String::as_str), Some("rm -rf /tmp/fw"));
    }
}
