//! 设备指纹
//!
//! 由本机环境信息派生主密码。这只是本地混淆：同一台机器上的任何进程都能重算出来。
//!
//! 只采集系统层面的来源（主机名 API、系统 locale 配置、时区），
//! 不读 `HOSTNAME`、`LANG` 这类随 shell 变化的环境变量。

use chrono::{Local, Offset, TimeZone};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// 指纹命名空间，改动会使所有已有密文失效
const FINGERPRINT_NAMESPACE: &str = "prism-arena/vault/v1";

/// 指纹组成部分
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub os: String,
    pub arch: String,
    pub host: String,
    pub locale: String,
    pub home_dir: String,
    /// 标准时区偏移（秒），不受夏令时切换影响
    pub tz_offset_secs: i32,
}

impl Fingerprint {
    /// 采集当前机器的指纹
    pub fn collect() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            host: host_name(),
            locale: system_locale(),
            home_dir: dirs::home_dir()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default(),
            tz_offset_secs: standard_offset_secs(),
        }
    }

    /// 主密码：各组成部分加命名空间的 SHA-256（hex）
    pub fn master_password(&self) -> String {
        let mut hasher = Sha256::new();
        for part in [
            self.os.as_str(),
            self.arch.as_str(),
            self.host.as_str(),
            self.locale.as_str(),
            self.home_dir.as_str(),
        ] {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        }
        hasher.update(self.tz_offset_secs.to_le_bytes());
        hasher.update(FINGERPRINT_NAMESPACE.as_bytes());
        hex::encode(hasher.finalize())
    }
}

fn host_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .map(|h| h.trim().to_string())
        .unwrap_or_default()
}

/// 系统 locale 配置文件；没有时为空
const LOCALE_FILES: [&str; 2] = ["/etc/locale.conf", "/etc/default/locale"];

fn system_locale() -> String {
    LOCALE_FILES
        .iter()
        .filter_map(|path| std::fs::read_to_string(path).ok())
        .find_map(|content| parse_locale_conf(&content))
        .unwrap_or_default()
}

/// 取 `LANG=` 行，去掉引号和编码后缀（`en_US.UTF-8` → `en_US`）
fn parse_locale_conf(content: &str) -> Option<String> {
    content
        .lines()
        .filter_map(|line| line.trim().strip_prefix("LANG="))
        .map(|value| value.trim().trim_matches('"').trim_matches('\''))
        .map(|value| value.split('.').next().unwrap_or_default().to_string())
        .find(|value| !value.is_empty())
}

/// 一月与七月偏移中较小者即标准时间
fn standard_offset_secs() -> i32 {
    // 2024-01-01 与 2024-07-01 UTC 零点
    [1_704_067_200_i64, 1_719_792_000_i64]
        .iter()
        .filter_map(|ts| Local.timestamp_opt(*ts, 0).single())
        .map(|t| t.offset().fix().local_minus_utc())
        .min()
        .unwrap_or(0)
}
