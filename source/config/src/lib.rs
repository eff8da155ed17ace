//! # OTA Configuration
//!
//! This crate is intended to be used by platform crates in two ways:
//!
//! ## In a `build.rs` script
//!
//! The platform crate should include this library:
//!
//! ```toml
//! [build-dependencies]
//! ota-config = { path = "../../source/config", features = ["use-std"] }
//! ```
//!
//! And ensure your build.rs contains a call to [`buildtime::render_file`]:
//!
//! ```rust,no_run
//! # #![allow(clippy::needless_doctest_main, non_camel_case_types)]
//! # #[derive(serde::Serialize, serde::Deserialize)]
//! # struct YOUR_CONFIG_TYPE(u8);
//! use ota_config::buildtime::render_file;
//! fn main() {
//!     render_file::<YOUR_CONFIG_TYPE>("YOUR_PLATFORM.toml").unwrap();
//! }
//! ```
//!
//! ## In the `main.rs`
//!
//! You'll need to include this crate *again* as a normal dependency:
//!
//! ```toml
//! [dependencies]
//! ota-config = { path = "../../source/config" }
//! ```
//!
//! And then you can use this in your main function:
//!
//! ```rust,ignore
//! # #![allow(non_camel_case_types)]
//! # #[derive(serde::Serialize, serde::Deserialize)]
//! # struct YOUR_CONFIG_TYPE(u8);
//! let config = ota_config::include_config!(YOUR_CONFIG_TYPE).unwrap();
//! let settings = config.ota.into_settings();
//! ```
//!
//! ## Make an external config crate
//!
//! In order to share data types between your platform crate and the platform
//! crate's build.rs, you should make a separate `platform-config` crate that
//! defines the shared data types.

#![cfg_attr(not(any(feature = "use-std", test)), no_std)]

use otafw::settings::OtaSettingsOverrides;
use serde::{Deserialize, Serialize};

/// The top level configuration type
///
/// This type is generic over the platform-specific configuration type
#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OtaConfig<Platform> {
    /// Upgrade settings. Anything left out takes its default.
    #[serde(default)]
    pub ota: OtaSettingsOverrides,
    pub platform: Platform,
}

pub const CONFIG_FILE_VAR: &str = "OTA_CONFIG";

/// Tools intended for use in build.rs scripts
#[cfg(feature = "use-std")]
pub mod buildtime {
    const OUT_DIR: &str = "OUT_DIR";
    const TAG: &str = concat!(module_path!(), ":");

    use std::{env, fs, io::Write, path::Path};

    use super::*;
    use miette::{Context, IntoDiagnostic, Result};
    use serde::de::DeserializeOwned;

    pub(crate) fn from_toml<Platform>(s: &str) -> Result<OtaConfig<Platform>>
    where
        Platform: DeserializeOwned + 'static,
    {
        toml::from_str(s).into_diagnostic()
    }

    pub(crate) fn to_postcard<Platform>(cfg: &OtaConfig<Platform>) -> Result<Vec<u8>>
    where
        Platform: Serialize,
    {
        postcard::to_stdvec(cfg).into_diagnostic()
    }

    fn out_dir() -> Result<String> {
        env::var(OUT_DIR)
            .into_diagnostic()
            .wrap_err_with(|| format!("Failed to read '{OUT_DIR}' env variable"))
    }

    /// Load a configuration file from the given path, will be made available
    /// to the main platform binary when they call [`include_config!()`].
    pub fn render_file<Platform>(path: impl AsRef<Path>) -> Result<()>
    where
        Platform: Serialize + DeserializeOwned + 'static,
    {
        let out_dir = out_dir()?;
        eprintln!("{TAG} {OUT_DIR}='{out_dir}'");
        render_file_to::<Platform>(path, out_dir)
    }

    pub(crate) fn render_file_to<Platform>(path: impl AsRef<Path>, out: impl AsRef<Path>) -> Result<()>
    where
        Platform: Serialize + DeserializeOwned + 'static,
    {
        let path = path.as_ref();
        let path_disp = path.display();

        (|| {
            let filename = path
                .file_name()
                .ok_or_else(|| miette::miette!("Path has no filename!"))?;
            eprintln!("{TAG} rendering config file '{path_disp}'",);
            let cfg = fs::read_to_string(path).into_diagnostic()?;
            let c: OtaConfig<Platform> = from_toml(&cfg)?;
            c.ota
                .clone()
                .into_settings()
                .validate()
                .into_diagnostic()
                .wrap_err("Invalid [ota] settings")?;

            let mut out = out.as_ref().join(filename);
            out.set_extension("postcard");
            let bin_cfg = to_postcard(&c)?;
            let mut f = fs::File::create(&out).into_diagnostic()?;
            f.write_all(&bin_cfg).into_diagnostic()?;
            println!("cargo:rustc-env={CONFIG_FILE_VAR}={}", out.display());
            println!("cargo:rerun-if-changed={path_disp}");

            Ok::<_, miette::Report>(())
        })()
        .wrap_err_with(|| format!("Failed to render config file '{path_disp}'"))
    }
}

/// Tools intended for use at runtime
pub mod runtime {
    use crate::OtaConfig;
    use serde::de::DeserializeOwned;

    #[derive(Debug, PartialEq)]
    pub enum Error {
        Postcard(postcard::Error),
    }

    pub fn from_postcard<Platform>(s: &[u8]) -> Result<OtaConfig<Platform>, Error>
    where
        Platform: DeserializeOwned + 'static,
    {
        postcard::from_bytes(s).map_err(Error::Postcard)
    }
}

/// Load the configuration created by `render_file` in a build.rs.
///
/// Should be called with the type of your platform specific type
#[macro_export]
macro_rules! include_config {
    ($platform: ty) => {{
        const OTA_CONFIG: &[u8] = include_bytes!(env!("OTA_CONFIG"));
        $crate::runtime::from_postcard::<$platform>(OTA_CONFIG)
    }};
}

#[cfg(all(test, feature = "use-std"))]
mod test {
    use super::*;
    use otafw::serial::RxTimeout;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Board {
        name: String,
    }

    #[test]
    fn toml_survives_the_build_step() {
        let cfg = buildtime::from_toml::<Board>(
            r#"
            [ota]
            upload_chunk = 200
            rx_timeout = { After = { secs = 3, nanos = 0 } }

            [platform]
            name = "devkit"
            "#,
        )
        .unwrap();
        let bytes = buildtime::to_postcard(&cfg).unwrap();
        let cfg = runtime::from_postcard::<Board>(&bytes).unwrap();

        assert_eq!(cfg.platform.name, "devkit");
        let settings = cfg.ota.into_settings();
        assert_eq!(settings.upload_chunk, 200);
        assert_eq!(settings.image_start_page, 128);
        assert_eq!(
            settings.rx_timeout,
            RxTimeout::After(core::time::Duration::from_secs(3))
        );
    }

    #[test]
    fn rendering_checks_ota_settings() {
        let dir = std::env::temp_dir().join(format!("ota-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let good = dir.join("good.toml");
        std::fs::write(&good, "[ota]\nupload_chunk = 64\n\n[platform]\nname = \"a\"\n").unwrap();
        buildtime::render_file_to::<Board>(&good, &dir).unwrap();
        let bytes = std::fs::read(dir.join("good.postcard")).unwrap();
        let cfg = runtime::from_postcard::<Board>(&bytes).unwrap();
        assert_eq!(cfg.ota.into_settings().upload_chunk, 64);

        let bad = dir.join("bad.toml");
        std::fs::write(&bad, "[ota]\nupload_chunk = 0\n\n[platform]\nname = \"b\"\n").unwrap();
        assert!(buildtime::render_file_to::<Board>(&bad, &dir).is_err());
        assert!(!dir.join("bad.postcard").exists());

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn ota_table_is_optional() {
        let cfg = buildtime::from_toml::<Board>("[platform]\nname = \"x\"\n").unwrap();
        assert_eq!(cfg.ota.into_settings(), otafw::OtaSettings::new());
    }
}
