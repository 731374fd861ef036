use super::{Exec, ExecInfo};
use crate::error::{RecoveryError, Result};
use crate::firmware::{
    install_fw_from_fw_image, is_dev_keys, read_ap_info, set_ap_info, InstallFwFromFwImageRequest,
    ReadApInfoRequest, SetApInfoRequest,
};
use async_trait::async_trait;

/// AP image location on the servo host, one per servod instance.
fn ap_image_path(info: &ExecInfo, port: u16) -> String {
    info.args
        .as_string("file_path", &format!("/tmp/bios_{port}.bin"))
}

pub struct ServoUpdateFwFromFwImage;

#[async_trait]
impl Exec for ServoUpdateFwFromFwImage {
    fn name(&self) -> &str {
        "servo_update_fw_from_fw_image"
    }

    fn description(&self) -> &str {
        "Flash EC and AP from the stable firmware image through servo"
    }

    async fn run(&self, info: &ExecInfo) -> Result<()> {
        let dut = info.dut();
        let image_url = dut
            .stable_version
            .as_ref()
            .map(|sv| sv.fw_image.clone())
            .filter(|url| !url.is_empty())
            .ok_or_else(|| RecoveryError::usage("update fw: no stable firmware image"))?;
        let servod = info.servod()?;
        let gbb_flags = Some(info.args.as_string("gbb_flags", "")).filter(|g| !g.is_empty());
        let req = InstallFwFromFwImageRequest {
            board: dut.board.clone(),
            model: dut.model.clone(),
            download_dir: info
                .args
                .as_string("download_dir", &format!("/tmp/fw_image_{}", servod.port())),
            image_url,
            download_timeout: info.args.as_duration_secs("download_timeout", 240),
            update_ec: info.args.as_bool("update_ec", true),
            update_ap: info.args.as_bool("update_ap", true),
            gbb_flags,
        };
        install_fw_from_fw_image(
            info.servo_host_runner()?,
            servod,
            info.cancel().clone(),
            &req,
        )
        .await
    }
}

pub struct ServoSetGbbFlags;

#[async_trait]
impl Exec for ServoSetGbbFlags {
    fn name(&self) -> &str {
        "servo_set_gbb_flags"
    }

    fn description(&self) -> &str {
        "Rewrite the AP GBB flags through servo"
    }

    async fn run(&self, info: &ExecInfo) -> Result<()> {
        let gbb_flags = info.required_arg("gbb_flags")?;
        let servod = info.servod()?;
        let req = SetApInfoRequest {
            file_path: ap_image_path(info, servod.port()),
            force_extract: info.args.as_bool("force_extract", true),
            gbb_flags,
        };
        set_ap_info(info.servo_host_runner()?, servod, info.cancel().clone(), &req).await
    }
}

pub struct ServoApNotDevSigned;

#[async_trait]
impl Exec for ServoApNotDevSigned {
    fn name(&self) -> &str {
        "servo_ap_not_dev_signed"
    }

    fn description(&self) -> &str {
        "AP firmware read through servo is not signed with dev keys"
    }

    async fn run(&self, info: &ExecInfo) -> Result<()> {
        let servod = info.servod()?;
        let req = ReadApInfoRequest {
            file_path: ap_image_path(info, servod.port()),
            force_extract: info.args.as_bool("force_extract", false),
            gbb_flags: false,
            keys: true,
        };
        let ap = read_ap_info(info.servo_host_runner()?, servod, info.cancel().clone(), &req).await?;
        if is_dev_keys(&ap.keys) {
            return Err(RecoveryError::failed("ap firmware is signed with dev keys"));
        }
        Ok(())
    }
}
