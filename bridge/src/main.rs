//! Process entrypoint: config load, `tracing` init, the global singleton init order from §9
//! (Store -> Buffer -> Mapping Table -> Adapters -> Dispatcher -> Janitor), signal handling,
//! and graceful shutdown that reverses it.

mod config;
mod metrics;

use anyhow::Context;
use bridge_adapters::{MqttEgress, MqttIngress, MqttIngressConfig, OpcuaEgress, OpcuaIngress, OpcuaIngressConfig};
use bridge_buffer::{Buffer, BufferLimits};
use bridge_core::{validate_transforms, Destination, EgressAdapter, MappingTable, TransformRegistry};
use bridge_dispatcher::{Dispatcher, DispatcherConfig, Janitor, JanitorConfig};
use clap::Parser;
use config::{BridgeConfig, Cli};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let cli = Cli::parse();
    let mut cfg = BridgeConfig::load(&cli.config).await.context("load bridge config")?;
    if let Some(db_path) = cli.db_path {
        cfg.buffer.db_path = db_path;
    }

    tracing::info!(event = "bridge.startup", config = %cli.config.display(), "loading bridge configuration");

    // Store -> Buffer
    let pools = bridge_store::open(&cfg.buffer.db_path).await.context("open store")?;
    let store = bridge_store::Store::new(pools);
    let buffer = Arc::new(Buffer::new(store, BufferLimits { max_pending: cfg.buffer.max_size }));

    // Mapping Table
    let transforms = Arc::new(TransformRegistry::default());
    validate_transforms(&cfg.mappings, &transforms).context("validate mapping transforms")?;
    let mapping = Arc::new(MappingTable::build(&cfg.mappings));
    tracing::info!(event = "bridge.mapping_table.built", entries = cfg.mappings.len(), "mapping table built");

    // Adapters
    let (mqtt_client, mqtt_eventloop) = connect_mqtt(&cfg.mqtt)?;
    let mqtt_egress: Arc<dyn EgressAdapter> = Arc::new(MqttEgress::new(mqtt_client.clone()));

    let opcua_session = connect_opcua(&cfg.opcua)?;
    let opcua_egress: Arc<dyn EgressAdapter> = Arc::new(OpcuaEgress::new(Arc::clone(&opcua_session)));

    let mut egress: HashMap<Destination, Arc<dyn EgressAdapter>> = HashMap::new();
    egress.insert(Destination::Mqtt, mqtt_egress);
    egress.insert(Destination::Opcua, opcua_egress);

    let default_ttl = chrono::Duration::milliseconds((cfg.buffer.message_ttl_minutes * 60_000.0) as i64);
    let mqtt_ingress = Arc::new(MqttIngress::new(
        Arc::clone(&mapping),
        Arc::clone(&buffer),
        Arc::clone(&transforms),
        MqttIngressConfig { default_ttl },
    ));
    let opcua_ingress = Arc::new(OpcuaIngress::new(
        Arc::clone(&mapping),
        Arc::clone(&buffer),
        Arc::clone(&transforms),
        OpcuaIngressConfig { default_ttl },
    ));

    let mqtt_topics: Vec<String> = cfg.mappings.iter().map(|m| m.mqtt_topic.clone()).collect();
    let opcua_nodes: Vec<String> = cfg.mappings.iter().map(|m| m.opcua_node_id.clone()).collect();

    let shutdown = CancellationToken::new();

    let mqtt_ingress_task = {
        let topics = mqtt_topics.clone();
        tokio::spawn(async move {
            bridge_adapters::mqtt::run_mqtt_ingress(mqtt_client, mqtt_eventloop, &topics, mqtt_ingress).await
        })
    };
    let _opcua_ingress_task = bridge_adapters::opcua_adapter::run_opcua_ingress(opcua_session, opcua_nodes, opcua_ingress)
        .context("start opc-ua ingress")?;

    // Dispatcher
    let dispatcher_cfg = DispatcherConfig {
        worker_count: cfg.buffer.worker_threads,
        batch_size: 16,
        lease_duration: Duration::from_secs(cfg.buffer.lease_duration_s),
        per_message_timeout: Duration::from_secs(cfg.buffer.per_message_timeout_s),
        base_backoff: Duration::from_secs(cfg.buffer.base_backoff_s),
        max_backoff: Duration::from_secs(cfg.buffer.max_backoff_s),
        max_retries: cfg.buffer.max_retries,
    };
    let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&buffer), egress, dispatcher_cfg));
    let worker_handles = dispatcher.spawn(shutdown.clone());

    // Janitor
    let janitor_cfg = JanitorConfig {
        interval: Duration::from_secs(cfg.buffer.cleanup_interval_s),
        retention: chrono::Duration::days(cfg.buffer.retention_days),
    };
    let janitor = Arc::new(Janitor::new(Arc::clone(&buffer), janitor_cfg));
    let janitor_handle = janitor.spawn(shutdown.clone());

    let metrics_handle = metrics::spawn(Arc::clone(&buffer), janitor_cfg.interval, shutdown.clone());

    tracing::info!(event = "bridge.started", "bridge running");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!(event = "bridge.shutdown.signal", "shutdown signal received");
        }
        res = mqtt_ingress_task => {
            tracing::error!(event = "bridge.mqtt_ingress.exited", result = ?res, "mqtt ingress task exited");
        }
    }

    // Teardown reverses init order: Janitor -> Dispatcher -> Adapters -> Mapping Table -> Buffer -> Store.
    shutdown.cancel();
    for handle in worker_handles {
        let _ = handle.await;
    }
    let _ = janitor_handle.await;
    let _ = metrics_handle.await;

    tracing::info!(event = "bridge.shutdown.complete", "bridge stopped");
    Ok(())
}

fn connect_mqtt(cfg: &config::MqttConfig) -> anyhow::Result<(rumqttc::AsyncClient, rumqttc::EventLoop)> {
    let mut options = rumqttc::MqttOptions::new(&cfg.client_id, &cfg.broker_host, cfg.broker_port);
    options.set_keep_alive(Duration::from_secs(30));
    if let (Some(username), Some(password)) = (&cfg.username, &cfg.password) {
        options.set_credentials(username.clone(), password.clone());
    }
    Ok(rumqttc::AsyncClient::new(options, 64))
}

fn connect_opcua(
    cfg: &config::OpcuaConfig,
) -> anyhow::Result<Arc<std::sync::RwLock<opcua::client::prelude::Session>>> {
    use opcua::client::prelude::*;

    // Only anonymous identity is wired up; username/certificate identities are a config
    // extension left for the SAP-style connectors this bridge doesn't ship (§2.1).
    anyhow::ensure!(cfg.allow_anonymous, "only allow_anonymous: true is currently supported");

    let mut client = ClientBuilder::new()
        .application_name("bridge")
        .application_uri("urn:bridge")
        .session_retry_limit(3)
        .client()
        .context("build opc-ua client")?;

    let session = client
        .connect_to_endpoint(
            (cfg.endpoint.as_ref(), cfg.security_policy.as_ref(), MessageSecurityMode::None),
            IdentityToken::Anonymous,
        )
        .context("connect to opc-ua endpoint")?;

    let session = Arc::try_unwrap(session)
        .map_err(|_| anyhow::anyhow!("unexpected extra reference to opc-ua session"))?
        .into_inner();
    Ok(Arc::new(std::sync::RwLock::new(session)))
}
