//! Firmware programming through a servo.
//!
//! A [`Programmer`] owns the servo between [`Programmer::prepare`] and
//! [`Programmer::close`]; every servod control changed by `prepare` is put
//! back by `close`. Use [`with_programmer`] so the pair brackets every exit
//! path, including errors and cancellation.

pub mod ap;
pub mod gbb;
pub mod tarball;

pub use ap::{
    install_fw_from_fw_image, is_dev_keys, read_ap_info, set_ap_info, ApInfo,
    InstallFwFromFwImageRequest, ReadApInfoRequest, SetApInfoRequest,
};
pub use gbb::{gbb_to_int, hex_format};
pub use tarball::{extract_ec_image, extract_from_tarball};

use crate::error::{RecoveryError, Result};
use crate::servo::{get_servo_type, get_string, ServoType};
use crate::tlw::{Runner, Servod, ServodValue};
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const FLASH_TIMEOUT: Duration = Duration::from_secs(30 * 60);
const CHECK_TIMEOUT: Duration = Duration::from_secs(60);

/// Controls a non-CCD servo needs before touching SPI flash, with their
/// required values.
const NON_CCD_CONTROLS: &[(&str, &str)] = &[
    ("spi2_vref", "pp3300"),
    ("spi2_buf_en", "on"),
    ("spi2_buf_on_flex_en", "on"),
    ("spi_hold", "off"),
    ("cold_reset", "on"),
    ("usbpd_reset", "on"),
];

// ---------------------------------------------------------------------------
// Programmer
// ---------------------------------------------------------------------------

pub struct Programmer {
    runner: Arc<dyn Runner>,
    servod: Arc<dyn Servod>,
    cancel: CancellationToken,
    servo_type: ServoType,
    /// Original values of controls changed by `prepare`, in change order.
    restore: Vec<(String, ServodValue)>,
}

impl Programmer {
    /// Build a programmer for the attached servo; only v3 and v4 are supported.
    pub async fn new(
        runner: Arc<dyn Runner>,
        servod: Arc<dyn Servod>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let servo_type = get_servo_type(servod.as_ref(), &cancel).await?;
        if !servo_type.is_v3() && !servo_type.is_v4() {
            return Err(RecoveryError::usage(format!(
                "firmware programmer: servo type {servo_type} is not supported"
            )));
        }
        Ok(Self {
            runner,
            servod,
            cancel,
            servo_type,
            restore: Vec::new(),
        })
    }

    pub fn servo_type(&self) -> &ServoType {
        &self.servo_type
    }

    fn required_controls(&self) -> &'static [(&'static str, &'static str)] {
        if self.servo_type.is_ccd() {
            &[]
        } else {
            NON_CCD_CONTROLS
        }
    }

    /// Drive the servo into programming state, remembering what it changed.
    pub async fn prepare(&mut self) -> Result<()> {
        for (control, want) in self.required_controls() {
            let current = self.servod.get(&self.cancel, control).await?;
            if current == ServodValue::from(*want) {
                continue;
            }
            self.servod
                .set(&self.cancel, control, ServodValue::from(*want))
                .await?;
            tracing::debug!(control, from = %current, to = want, "prepared servod control");
            self.restore.push((control.to_string(), current));
        }
        Ok(())
    }

    /// Put back every control `prepare` changed, newest first. Keeps going
    /// past failures and returns the first one.
    pub async fn close(&mut self) -> Result<()> {
        // Restoring must outlive a cancelled run.
        let cancel = if self.cancel.is_cancelled() {
            CancellationToken::new()
        } else {
            self.cancel.clone()
        };
        let mut first_err = None;
        while let Some((control, value)) = self.restore.pop() {
            if let Err(e) = self.servod.set(&cancel, &control, value.clone()).await {
                tracing::warn!(control = %control, error = %e, "failed to restore servod control");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn run(&self, timeout: Duration, cmd: &str, args: &[&str]) -> Result<String> {
        self.runner.run(&self.cancel, timeout, cmd, args).await
    }

    async fn require_file(&self, path: &str) -> Result<()> {
        self.run(CHECK_TIMEOUT, "test", &["-f", path])
            .await
            .map(|_| ())
            .map_err(|e| e.context(format!("image {path} not found")))
    }

    async fn require_tool(&self, tool: &str) -> Result<()> {
        self.run(CHECK_TIMEOUT, "which", &[tool])
            .await
            .map(|_| ())
            .map_err(|e| e.context(format!("tool {tool} not available")))
    }

    pub async fn program_ec(&self, image: &str) -> Result<()> {
        self.require_file(image).await?;
        self.require_tool("flash_ec").await?;
        let chip = get_string(self.servod.as_ref(), &self.cancel, "ec_chip").await?;
        let chip_arg = format!("--chip={chip}");
        let image_arg = format!("--image={image}");
        let port_arg = format!("--port={}", self.servod.port());
        let mut args = vec![chip_arg.as_str(), image_arg.as_str(), port_arg.as_str()];
        if chip == "stm32" {
            args.push("--bitbang_rate=57600");
        }
        args.extend(["--verify", "--verbose"]);
        tracing::info!(chip = %chip, image, "programming ec");
        self.run(FLASH_TIMEOUT, "flash_ec", &args)
            .await
            .map(|_| ())
            .map_err(|e| e.context("program ec"))
    }

    pub async fn program_ap(&self, image: &str, gbb_hex: Option<&str>) -> Result<()> {
        self.require_file(image).await?;
        self.require_tool("futility").await?;
        let port_arg = format!("--servo_port={}", self.servod.port());
        let gbb_arg = match gbb_hex {
            Some(hex) => Some(format!("--gbb_flags={}", gbb_to_int(hex)?)),
            None => None,
        };
        let mut args = vec!["update", "-i", image, port_arg.as_str()];
        if let Some(gbb) = &gbb_arg {
            args.push(gbb.as_str());
        }
        tracing::info!(image, gbb = ?gbb_hex, "programming ap");
        self.run(FLASH_TIMEOUT, "futility", &args)
            .await
            .map(|_| ())
            .map_err(|e| e.context("program ap"))
    }

    /// `flashrom` programmer string for the debug adapter attached to the AP.
    async fn ap_programmer_name(&self) -> Result<String> {
        let control = self.servo_type.serial_name_option();
        let serial = get_string(self.servod.as_ref(), &self.cancel, control).await?;
        if self.servo_type.is_micro() || self.servo_type.is_c2d2() {
            Ok(format!("raiden_debug_spi:serial={serial}"))
        } else if self.servo_type.is_ccd() {
            Ok(format!("raiden_debug_spi:target=AP,serial={serial}"))
        } else {
            Err(RecoveryError::usage(format!(
                "extract ap: no programmer for servo type {}",
                self.servo_type
            )))
        }
    }

    /// Read the AP flash into `image`. An existing file is kept unless `force`.
    pub async fn extract_ap(&self, image: &str, force: bool) -> Result<()> {
        if !force && self.run(CHECK_TIMEOUT, "test", &["-f", image]).await.is_ok() {
            tracing::debug!(image, "ap image already extracted");
            return Ok(());
        }
        let programmer = self.ap_programmer_name().await?;
        self.run(FLASH_TIMEOUT, "flashrom", &["-p", &programmer, "-r", image])
            .await
            .map(|_| ())
            .map_err(|e| e.context("extract ap"))
    }
}

/// Run `f` with a prepared programmer and always close it afterwards.
///
/// The body is dropped once `cancel` fires. The body's error wins over a
/// close error; a close error is returned only when the body succeeded.
pub async fn with_programmer<T, F>(
    runner: Arc<dyn Runner>,
    servod: Arc<dyn Servod>,
    cancel: CancellationToken,
    f: F,
) -> Result<T>
where
    F: for<'p> FnOnce(&'p Programmer) -> BoxFuture<'p, Result<T>>,
{
    let stop = cancel.clone();
    let mut programmer = Programmer::new(runner, servod, cancel).await?;
    let result = match programmer.prepare().await {
        Ok(()) => tokio::select! {
            res = f(&programmer) => res,
            _ = stop.cancelled() => Err(RecoveryError::Cancelled),
        },
        Err(e) => Err(e.context("prepare programmer")),
    };
    let closed = programmer.close().await;
    match (result, closed) {
        (Err(e), Err(close_err)) => {
            tracing::warn!(error = %close_err, "close programmer");
            Err(e)
        }
        (Ok(_), Err(close_err)) => Err(close_err),
        (result, Ok(())) => result,
    }
}
