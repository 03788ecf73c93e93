//! `lims worker`: build a station from its config and serve it over the relay.

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use lims_devices::{ArmConfig, BalanceConfig, DeviceRegistry, SharedArm, Sleeper, ThreadSleeper};
use lims_instruments::{GcmsClient, HplcClient, HplcCredentials, MsConverter, MzmlCache, QualClient};
use lims_station::hplc::{SERIES_TARGET, SERIES_THRESHOLD};
use lims_station::{DispensingStation, GcmsSettings, GcmsStation, HplcSettings, HplcStation, ResultQueries};
use lims_storage::{HttpTaskStore, ResultArchive, SequenceCatalog, TaskStore};
use lims_worker::{
    DispensingHandle, GcmsHandle, HplcHandle, LinkMode, StationHandle, WorkerClient, WorkerConfig,
};
use tracing::{info, warn};

use crate::config::{Kind, Link, StationConfig};

type BoxError = Box<dyn Error + Send + Sync>;

/// Upper bound on one msconvert invocation.
const MSCONVERT_TIMEOUT: Duration = Duration::from_secs(300);

pub async fn run(config: StationConfig) -> Result<(), BoxError> {
    let worker_config = WorkerConfig {
        url: config.relay_url(),
        link: match config.relay.link {
            Link::Room => LinkMode::Room,
            Link::Hub => LinkMode::Hub {
                reply_to: config.relay.reply_to.clone(),
            },
        },
        station_name: config.station_name(),
        status_interval: config.status_interval(),
        reconnect_delay: config.reconnect_delay(),
    };
    let store = task_store(&config);

    // Opening the serial port and the arm socket blocks.
    let station = tokio::task::spawn_blocking(move || build_station(&config)).await??;
    info!(kind = %station.kind(), url = %worker_config.url, "station ready");

    let mut client = WorkerClient::new(worker_config, station);
    if let Some(store) = store {
        client = client.with_task_store(store);
    }
    client
        .run(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await;
    Ok(())
}

fn task_store(config: &StationConfig) -> Option<Arc<dyn TaskStore>> {
    let Some(url) = &config.storage.task_store_url else {
        warn!("no task store configured; task results will not be submitted");
        return None;
    };
    let mut store = HttpTaskStore::new(url.clone());
    if let Some(token) = &config.storage.task_store_token {
        store = store.with_token(token.clone());
    }
    Some(Arc::new(store))
}

fn build_station(config: &StationConfig) -> Result<Arc<dyn StationHandle>, BoxError> {
    let sleeper: Arc<dyn Sleeper> = Arc::new(ThreadSleeper);
    let registry = DeviceRegistry::new();
    let arm = open_arm(&registry, config, &sleeper);

    match config.station.kind {
        Kind::Gcms => {
            let archive = ResultArchive::open(&config.storage.archive_dir)?;
            let catalog = catalog(config)?;
            let gcms = &config.gcms;
            let timeout = Duration::from_secs(gcms.timeout_secs);

            let mut settings = GcmsSettings::default();
            if let Some(file) = &gcms.default_sequence_file {
                settings.default_sequence_file = file.clone();
            }
            let station = GcmsStation::new(
                GcmsClient::new(gcms.base_url.clone(), timeout),
                arm,
                catalog.clone(),
                archive.clone(),
            )
            .with_settings(settings);

            let converter = MsConverter::locate(gcms.msconvert.clone(), MSCONVERT_TIMEOUT);
            let results = ResultQueries::new(archive, catalog)
                .with_peak_finder(Arc::new(QualClient::new(gcms.qual_base_url.clone(), timeout)))
                .with_spectra(MzmlCache::new(gcms.mzml_dir.clone(), converter));
            Ok(Arc::new(GcmsHandle::new(station, results)))
        }
        Kind::Hplc => {
            let archive = ResultArchive::open(&config.storage.archive_dir)?;
            let hplc = &config.hplc;
            let settings = HplcSettings {
                credentials: HplcCredentials {
                    username: hplc.username.clone(),
                    password: hplc.password.clone(),
                },
                cds_id: hplc.cds_id,
                remote_data: hplc.remote_data.clone(),
                local_data: hplc.local_data.clone(),
                ..HplcSettings::default()
            };
            let base_url = hplc.base_url.clone();
            let timeout = Duration::from_secs(hplc.timeout_secs);
            let station = HplcStation::new(
                move || HplcClient::new(base_url.clone(), timeout),
                arm,
                archive.clone(),
            )
            .with_settings(settings);

            let results = ResultQueries::new(archive, SequenceCatalog::parse(""))
                .with_thinning(SERIES_THRESHOLD, SERIES_TARGET);
            Ok(Arc::new(HplcHandle::new(station, results)))
        }
        Kind::Gypl => {
            let balance = BalanceConfig {
                port: config.balance.port.clone(),
                baud: config.balance.baud,
                ..BalanceConfig::default()
            };
            registry.open_balance(balance, Arc::clone(&sleeper))?;
            let station = DispensingStation::from_registry(&registry, sleeper)?;
            Ok(Arc::new(DispensingHandle::new(station)))
        }
    }
}

fn open_arm(registry: &DeviceRegistry, config: &StationConfig, sleeper: &Arc<dyn Sleeper>) -> SharedArm {
    let arm = ArmConfig {
        address: config.arm.address.clone(),
        timeout: Duration::from_secs(config.arm.timeout_secs),
        ..ArmConfig::default()
    };
    registry.open_arm(arm, Arc::clone(sleeper))
}

fn catalog(config: &StationConfig) -> Result<SequenceCatalog, BoxError> {
    match &config.gcms.sequence_list {
        Some(list) => Ok(SequenceCatalog::load(list, config.gcms.sequence_params.as_deref())?),
        None => {
            warn!("no sequence list configured; only the default sequence can run");
            Ok(SequenceCatalog::parse(""))
        }
    }
}
