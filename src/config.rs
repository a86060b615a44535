use std::{collections::BTreeSet, path::Path, str::FromStr, time::Duration};

use alloy::{
    primitives::{Address, U256},
    signers::local::PrivateKeySigner,
    transports::http::reqwest::Url,
};
use cron::Schedule;
use serde::Deserialize;

use crate::{error::ConfigError, guard::Thresholds};

pub const DEFAULT_SCHEDULE: &str = "*/15 * * * *";
pub const DEFAULT_GAS_LIMIT: u64 = 500_000;
pub const DEFAULT_RECEIPT_POLL_SECS: u64 = 2;
pub const DEFAULT_DEPLOYMENT_FILE: &str = "../deployment.json";
pub const DEFAULT_DOTENV_FILE: &str = "../.env";

const GWEI: u128 = 1_000_000_000;

pub const RPC_URL_VAR: &str = "GOERLI_RPC_URL";
pub const KEY_VARS: [&str; 2] = ["KEEPER_PRIVATE_KEY", "PRIVATE_KEY"];
pub const VAULT_VAR: &str = "VAULT_ADDRESS";
pub const SCHEDULE_VAR: &str = "HARVEST_SCHEDULE";

/// Optional YAML file given with `--config`. Anything left out keeps its default,
/// and the environment wins over the file.
#[derive(Deserialize, Default, Debug)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    /// Cron expression, five fields (minute first) or the six/seven field form with seconds
    pub schedule: Option<String>,
    /// Highest gas price we are willing to pay, in Gwei
    pub max_gas_price_gwei: Option<u64>,
    /// Minimum seconds between harvests
    pub min_interval_seconds: Option<u64>,
    /// Minimum vault balance in the smallest unit of the vault token
    pub min_vault_balance: Option<Amount>,
    /// Gas limit attached to the harvest transaction
    pub gas_limit: Option<u64>,
    /// How often to poll for the harvest receipt
    pub receipt_poll_interval_secs: Option<u64>,
    /// Give up waiting for a receipt after this long, unbounded when unset
    pub receipt_timeout_secs: Option<u64>,
    /// Deployment descriptor consulted when VAULT_ADDRESS is unset
    pub deployment_file: Option<String>,
    /// Dotenv file loaded before the environment is read
    pub dotenv_file: Option<String>,
}

/// Token amounts in YAML may be plain integers or decimal strings when they exceed 64 bits.
#[derive(Deserialize, Debug, Clone)]
#[serde(untagged)]
pub enum Amount {
    Number(u64),
    Text(String),
}

impl Amount {
    fn to_u256(&self) -> Result<U256, ConfigError> {
        match self {
            Amount::Number(n) => Ok(U256::from(*n)),
            Amount::Text(s) => U256::from_str(s.trim()).map_err(|_| ConfigError::InvalidValue {
                name: "min_vault_balance",
                value: s.clone(),
            }),
        }
    }
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let err = |reason: String| ConfigError::File { path: path.display().to_string(), reason };
        let raw = std::fs::read_to_string(path).map_err(|e| err(e.to_string()))?;
        serde_yaml::from_str(&raw).map_err(|e| err(e.to_string()))
    }

    pub fn dotenv_path(&self) -> &str {
        self.dotenv_file.as_deref().unwrap_or(DEFAULT_DOTENV_FILE)
    }
}

pub const DEFAULT_CONFIG_TEMPLATE: &str = r#"
# When to check the vault. Five fields (minute hour day month weekday),
# or the cron crate's six/seven field form with a leading seconds field.
schedule: "*/15 * * * *"

# Skip the harvest when the node's gas price is above this (Gwei)
max_gas_price_gwei: 100

# Minimum seconds since the vault's lastHarvest()
min_interval_seconds: 3600

# Minimum vault balance() in the token's smallest unit (1000 USDC)
min_vault_balance: 1000000000

# Gas limit for harvest()
gas_limit: 500000

# Receipt polling; leave receipt_timeout_secs out to wait until mined
receipt_poll_interval_secs: 2
# receipt_timeout_secs: 600

# Where to find the vault when VAULT_ADDRESS is not set
deployment_file: "../deployment.json"

# Loaded before reading GOERLI_RPC_URL, KEEPER_PRIVATE_KEY / PRIVATE_KEY, VAULT_ADDRESS
dotenv_file: "../.env"
"#;

/// Everything the keeper needs before talking to the node. The signer itself is
/// handed out separately since only the chain client may hold it.
#[derive(Debug)]
pub struct Settings {
    pub rpc_endpoint: Url,
    pub signer_address: Address,
    pub vault_address: Address,
    pub schedule_expr: String,
    pub schedule: Schedule,
    pub thresholds: Thresholds,
    pub gas_limit: u64,
    pub receipt_poll_interval: Duration,
    pub receipt_timeout: Option<Duration>,
}

/// Immutable keeper configuration, shared by reference for the life of the process.
#[derive(Debug, Clone)]
pub struct KeeperConfig {
    pub rpc_endpoint: Url,
    pub signer_address: Address,
    pub vault_address: Address,
    /// Observed once at init and pinned into every transaction.
    pub chain_id: u64,
    pub schedule_expr: String,
    pub schedule: Schedule,
    pub thresholds: Thresholds,
    pub gas_limit: u64,
    pub receipt_poll_interval: Duration,
    pub receipt_timeout: Option<Duration>,
}

impl Settings {
    /// Reads the process environment on top of `file`.
    pub fn from_env(file: &FileConfig) -> Result<(Self, PrivateKeySigner), ConfigError> {
        Self::resolve(file, &|name| std::env::var(name).ok())
    }

    pub fn resolve(
        file: &FileConfig,
        env: &dyn Fn(&str) -> Option<String>,
    ) -> Result<(Self, PrivateKeySigner), ConfigError> {
        let var = |name: &str| env(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let rpc = var(RPC_URL_VAR).ok_or(ConfigError::MissingEnv(RPC_URL_VAR))?;
        let rpc_endpoint = Url::parse(&rpc)
            .map_err(|_| ConfigError::InvalidValue { name: RPC_URL_VAR, value: rpc.clone() })?;

        let key = KEY_VARS.iter().find_map(|name| var(*name)).ok_or(ConfigError::MissingKey)?;
        let signer =
            PrivateKeySigner::from_str(&key).map_err(|e| ConfigError::InvalidKey(e.to_string()))?;

        let vault_address = match var(VAULT_VAR) {
            Some(addr) => parse_address(&addr)?,
            None => {
                let path = file.deployment_file.as_deref().unwrap_or(DEFAULT_DEPLOYMENT_FILE);
                vault_from_descriptor(Path::new(path))?
            }
        };

        let schedule_expr = var(SCHEDULE_VAR)
            .or_else(|| file.schedule.clone())
            .unwrap_or_else(|| DEFAULT_SCHEDULE.to_string());
        let schedule = parse_schedule(&schedule_expr)?;

        let mut thresholds = Thresholds::default();
        if let Some(gwei) = parse_var::<u128>(&var, "MAX_GAS_PRICE_GWEI")?
            .or(file.max_gas_price_gwei.map(u128::from))
        {
            thresholds.max_gas_price_wei = gwei.checked_mul(GWEI).ok_or(ConfigError::InvalidValue {
                name: "MAX_GAS_PRICE_GWEI",
                value: gwei.to_string(),
            })?;
        }
        if let Some(secs) = parse_var::<u64>(&var, "MIN_HARVEST_INTERVAL")?.or(file.min_interval_seconds) {
            thresholds.min_interval_seconds = secs;
        }
        if let Some(bal) = parse_var::<U256>(&var, "MIN_VAULT_BALANCE")? {
            thresholds.min_vault_balance = bal;
        } else if let Some(amount) = &file.min_vault_balance {
            thresholds.min_vault_balance = amount.to_u256()?;
        }

        let gas_limit = parse_var::<u64>(&var, "HARVEST_GAS_LIMIT")?
            .or(file.gas_limit)
            .unwrap_or(DEFAULT_GAS_LIMIT);

        let settings = Settings {
            rpc_endpoint,
            signer_address: signer.address(),
            vault_address,
            schedule_expr,
            schedule,
            thresholds,
            gas_limit,
            receipt_poll_interval: Duration::from_secs(
                file.receipt_poll_interval_secs.unwrap_or(DEFAULT_RECEIPT_POLL_SECS).max(1),
            ),
            receipt_timeout: file.receipt_timeout_secs.map(Duration::from_secs),
        };
        Ok((settings, signer))
    }

    /// Pins the chain id observed from the node.
    pub fn into_config(self, chain_id: u64) -> KeeperConfig {
        KeeperConfig {
            rpc_endpoint: self.rpc_endpoint,
            signer_address: self.signer_address,
            vault_address: self.vault_address,
            chain_id,
            schedule_expr: self.schedule_expr,
            schedule: self.schedule,
            thresholds: self.thresholds,
            gas_limit: self.gas_limit,
            receipt_poll_interval: self.receipt_poll_interval,
            receipt_timeout: self.receipt_timeout,
        }
    }
}

fn parse_var<T: FromStr>(
    var: &dyn Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<T>, ConfigError> {
    var(name)
        .map(|value| value.parse::<T>().map_err(|_| ConfigError::InvalidValue { name, value }))
        .transpose()
}

fn parse_address(s: &str) -> Result<Address, ConfigError> {
    match Address::from_str(s) {
        Ok(addr) if addr != Address::ZERO => Ok(addr),
        _ => Err(ConfigError::InvalidAddress(s.to_string())),
    }
}

#[derive(Deserialize)]
struct Deployment {
    #[serde(default)]
    contracts: Option<DeploymentContracts>,
    #[serde(default)]
    vault: Option<String>,
}

#[derive(Deserialize)]
struct DeploymentContracts {
    #[serde(default)]
    vault: Option<String>,
}

/// Pulls the vault out of the JSON written by the deploy script
/// (`{"contracts": {"vault": "0x.."}}`).
pub fn vault_from_descriptor(path: &Path) -> Result<Address, ConfigError> {
    let shown = path.display().to_string();
    if !path.exists() {
        return Err(ConfigError::MissingVault(shown));
    }
    let raw = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Descriptor { path: shown.clone(), reason: e.to_string() })?;
    let desc: Deployment = serde_json::from_str(&raw)
        .map_err(|e| ConfigError::Descriptor { path: shown.clone(), reason: e.to_string() })?;
    let vault = desc
        .contracts
        .and_then(|c| c.vault)
        .or(desc.vault)
        .ok_or(ConfigError::Descriptor { path: shown, reason: "no vault entry".into() })?;
    log::info!("Reading vault address from {}", path.display());
    parse_address(vault.trim())
}

const WEEKDAYS: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

/// Rewrites a numeric crontab weekday field (0-7, Sunday is 0 and 7) as day
/// names, since the cron crate counts Sunday as 1. `None` leaves the field as
/// written: wildcards, steps over `*` and names already agree.
fn crontab_weekdays(field: &str) -> Option<String> {
    let mut days = BTreeSet::new();
    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => (range, step.parse::<usize>().ok().filter(|s| *s > 0)?),
            None => (part, 1),
        };
        let (lo, hi) = match range.split_once('-') {
            Some((lo, hi)) => (lo.parse::<usize>().ok()?, hi.parse::<usize>().ok()?),
            None => {
                let day = range.parse::<usize>().ok()?;
                (day, if part.contains('/') { 6 } else { day })
            }
        };
        if lo > hi || hi > 7 {
            return None;
        }
        days.extend((lo..=hi).step_by(step).map(|d| d % 7));
    }
    Some(days.into_iter().map(|d| WEEKDAYS[d]).collect::<Vec<_>>().join(","))
}

/// The cron crate wants a leading seconds field; plain five-field crontab lines
/// fire at second 0 and get their weekday numbers translated.
pub fn normalize_schedule(expr: &str) -> String {
    let expr = expr.trim();
    let fields: Vec<&str> = expr.split_whitespace().collect();
    match fields.as_slice() {
        [min, hour, dom, month, dow] => {
            let dow = crontab_weekdays(dow).unwrap_or_else(|| dow.to_string());
            format!("0 {min} {hour} {dom} {month} {dow}")
        }
        _ => expr.to_string(),
    }
}

pub fn parse_schedule(expr: &str) -> Result<Schedule, ConfigError> {
    Schedule::from_str(&normalize_schedule(expr)).map_err(|e| ConfigError::InvalidSchedule {
        expr: expr.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
pub fn test_config() -> KeeperConfig {
    KeeperConfig {
        rpc_endpoint: Url::parse("http://localhost:8545").unwrap(),
        signer_address: Address::repeat_byte(0x11),
        vault_address: Address::repeat_byte(0x22),
        chain_id: 5,
        schedule_expr: DEFAULT_SCHEDULE.into(),
        schedule: parse_schedule(DEFAULT_SCHEDULE).unwrap(),
        thresholds: Thresholds::default(),
        gas_limit: DEFAULT_GAS_LIMIT,
        receipt_poll_interval: Duration::from_millis(5),
        receipt_timeout: None,
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::{HashMap, HashSet},
        io::Write,
    };

    use super::*;

    const KEY: &str = "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
    const KEY_ADDR: &str = "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266";
    const VAULT: &str = "0xb6494e339FD35abA0E5845a2dc0B47D14c68993d";

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |name| map.get(name).cloned()
    }

    fn base() -> Vec<(&'static str, &'static str)> {
        vec![
            (RPC_URL_VAR, "http://localhost:8545"),
            ("KEEPER_PRIVATE_KEY", KEY),
            (VAULT_VAR, VAULT),
        ]
    }

    fn descriptor(body: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(body.as_bytes()).unwrap();
        f
    }

    #[test]
    fn defaults() {
        let (s, signer) = Settings::resolve(&FileConfig::default(), &env(&base())).unwrap();
        assert_eq!(signer.address(), Address::from_str(KEY_ADDR).unwrap());
        assert_eq!(s.signer_address, signer.address());
        assert_eq!(s.vault_address, Address::from_str(VAULT).unwrap());
        assert_eq!(s.schedule_expr, DEFAULT_SCHEDULE);
        assert_eq!(s.thresholds, Thresholds::default());
        assert_eq!(s.thresholds.max_gas_price_wei, 100_000_000_000);
        assert_eq!(s.gas_limit, 500_000);
        assert_eq!(s.receipt_poll_interval, Duration::from_secs(2));
        assert!(s.receipt_timeout.is_none());
    }

    #[test]
    fn missing_rpc_is_fatal() {
        let vars: Vec<_> = base().into_iter().filter(|(k, _)| *k != RPC_URL_VAR).collect();
        let err = Settings::resolve(&FileConfig::default(), &env(&vars)).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnv(RPC_URL_VAR)));
    }

    #[test]
    fn key_falls_back_to_private_key() {
        let vars = [(RPC_URL_VAR, "http://localhost:8545"), ("PRIVATE_KEY", KEY), (VAULT_VAR, VAULT)];
        let (_, signer) = Settings::resolve(&FileConfig::default(), &env(&vars)).unwrap();
        assert_eq!(signer.address(), Address::from_str(KEY_ADDR).unwrap());

        let vars = [(RPC_URL_VAR, "http://localhost:8545"), (VAULT_VAR, VAULT)];
        let err = Settings::resolve(&FileConfig::default(), &env(&vars)).unwrap_err();
        assert!(matches!(err, ConfigError::MissingKey));
    }

    #[test]
    fn malformed_key_is_fatal() {
        let vars = [(RPC_URL_VAR, "http://localhost:8545"), ("KEEPER_PRIVATE_KEY", "zz12"), (VAULT_VAR, VAULT)];
        let err = Settings::resolve(&FileConfig::default(), &env(&vars)).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidKey(_)));
    }

    #[test]
    fn vault_from_deployment_json() {
        let f = descriptor(&format!(
            r#"{{"network":"goerli","contracts":{{"vault":"{VAULT}","strategy":"0x0000000000000000000000000000000000000001"}}}}"#
        ));
        let vars: Vec<_> = base().into_iter().filter(|(k, _)| *k != VAULT_VAR).collect();
        let file = FileConfig {
            deployment_file: Some(f.path().display().to_string()),
            ..Default::default()
        };
        let (s, _) = Settings::resolve(&file, &env(&vars)).unwrap();
        assert_eq!(s.vault_address, Address::from_str(VAULT).unwrap());
    }

    #[test]
    fn missing_vault_is_fatal() {
        let vars: Vec<_> = base().into_iter().filter(|(k, _)| *k != VAULT_VAR).collect();
        let file = FileConfig {
            deployment_file: Some("/nonexistent/deployment.json".into()),
            ..Default::default()
        };
        let err = Settings::resolve(&file, &env(&vars)).unwrap_err();
        assert!(matches!(err, ConfigError::MissingVault(_)));

        let f = descriptor(r#"{"contracts":{"strategy":"0x0000000000000000000000000000000000000001"}}"#);
        assert!(matches!(vault_from_descriptor(f.path()), Err(ConfigError::Descriptor { .. })));
    }

    #[test]
    fn zero_vault_rejected() {
        let mut vars = base();
        vars.retain(|(k, _)| *k != VAULT_VAR);
        vars.push((VAULT_VAR, "0x0000000000000000000000000000000000000000"));
        let err = Settings::resolve(&FileConfig::default(), &env(&vars)).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidAddress(_)));
    }

    #[test]
    fn env_beats_file() {
        let file: FileConfig = serde_yaml::from_str(
            "schedule: \"0 * * * *\"\nmax_gas_price_gwei: 30\nmin_interval_seconds: 60\ngas_limit: 250000\n",
        )
        .unwrap();
        let mut vars = base();
        vars.push(("MAX_GAS_PRICE_GWEI", "45"));
        vars.push((SCHEDULE_VAR, "*/5 * * * *"));
        let (s, _) = Settings::resolve(&file, &env(&vars)).unwrap();
        assert_eq!(s.thresholds.max_gas_price_wei, 45 * GWEI);
        assert_eq!(s.thresholds.min_interval_seconds, 60);
        assert_eq!(s.gas_limit, 250_000);
        assert_eq!(s.schedule_expr, "*/5 * * * *");
    }

    #[test]
    fn bad_numbers_are_not_defaulted() {
        let mut vars = base();
        vars.push(("MIN_VAULT_BALANCE", "lots"));
        let err = Settings::resolve(&FileConfig::default(), &env(&vars)).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { name: "MIN_VAULT_BALANCE", .. }));
    }

    #[test]
    fn schedules() {
        assert_eq!(normalize_schedule("*/15 * * * *"), "0 */15 * * * *");
        assert_eq!(normalize_schedule("0 */5 * * * * *"), "0 */5 * * * * *");
        assert!(parse_schedule(DEFAULT_SCHEDULE).is_ok());
        assert!(matches!(parse_schedule("every tuesday"), Err(ConfigError::InvalidSchedule { .. })));
    }

    fn fire_days(expr: &str) -> HashSet<chrono::Weekday> {
        use chrono::Datelike;
        parse_schedule(expr).unwrap().upcoming(chrono::Utc).take(14).map(|t| t.weekday()).collect()
    }

    #[test]
    fn crontab_weekdays_count_sunday_as_zero() {
        use chrono::Weekday::*;

        assert_eq!(normalize_schedule("0 9 * * 1-5"), "0 0 9 * * Mon,Tue,Wed,Thu,Fri");
        assert_eq!(fire_days("0 9 * * 1-5"), HashSet::from([Mon, Tue, Wed, Thu, Fri]));
        assert_eq!(fire_days("0 9 * * 0"), HashSet::from([Sun]));
        assert_eq!(fire_days("0 9 * * 7"), HashSet::from([Sun]));
        assert_eq!(fire_days("0 9 * * 5-7"), HashSet::from([Fri, Sat, Sun]));
        assert_eq!(fire_days("0 9 * * 0,3"), HashSet::from([Sun, Wed]));
        assert_eq!(fire_days("0 9 * * 1-5/2"), HashSet::from([Mon, Wed, Fri]));
        assert_eq!(fire_days("0 9 * * Mon-Fri"), HashSet::from([Mon, Tue, Wed, Thu, Fri]));
        assert_eq!(normalize_schedule("0 9 * * *"), "0 0 9 * * *");
        // seconds-first expressions keep the cron crate's own numbering
        assert_eq!(normalize_schedule("0 0 9 * * 2"), "0 0 9 * * 2");
        assert!(matches!(parse_schedule("0 9 * * 8"), Err(ConfigError::InvalidSchedule { .. })));
    }

    #[test]
    fn top_level_vault_in_descriptor() {
        let f = descriptor(&format!(r#"{{"network":"goerli","vault":"{VAULT}"}}"#));
        assert_eq!(vault_from_descriptor(f.path()).unwrap(), Address::from_str(VAULT).unwrap());
    }

    #[test]
    fn template_matches_defaults() {
        let file: FileConfig = serde_yaml::from_str(DEFAULT_CONFIG_TEMPLATE).unwrap();
        let (s, _) = Settings::resolve(&file, &env(&base())).unwrap();
        assert_eq!(s.thresholds, Thresholds::default());
        assert_eq!(s.gas_limit, DEFAULT_GAS_LIMIT);
        assert_eq!(s.schedule_expr, DEFAULT_SCHEDULE);
        assert_eq!(file.dotenv_path(), DEFAULT_DOTENV_FILE);
    }

    #[test]
    fn into_config_pins_chain() {
        let (s, signer) = Settings::resolve(&FileConfig::default(), &env(&base())).unwrap();
        let cfg = s.into_config(5);
        assert_eq!(cfg.chain_id, 5);
        assert_eq!(cfg.signer_address, signer.address());
    }
}
