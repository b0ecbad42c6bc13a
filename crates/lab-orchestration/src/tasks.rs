//! Background jobs run on the worker pools
//!
//! Provisioning jobs run on the owning environment's pool, teardown jobs on
//! the agent-wide teardown pool. A provisioning job checks the environment
//! status twice: before creating anything, and when registering the started
//! lab. Registration and the switch to `Closing` both happen under the
//! environment lock, so a lab that misses registration is torn down by the
//! job that created it and can never be left running unregistered.

use crate::agent::AgentInner;
use crate::environment::{Environment, EnvironmentStatus};
use crate::error::{Error, Failures, Result};
use crate::infra::LabSpec;
use crate::lab::Lab;
use crate::stream::LabEvent;
use range_network::ClientConfig;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Bring up an environment's VPN interface and mark it running
pub(crate) async fn setup_environment(inner: Arc<AgentInner>, env: Arc<Environment>) {
    let config = env.config();
    let result = inner
        .collab
        .vpn
        .open_interface(env.tag(), config.vpn_address, config.vpn_port)
        .await;

    match result {
        Ok(()) => {
            let ready = env.advance(EnvironmentStatus::Running);
            inner.persist().await;
            if ready {
                info!("Environment {} is ready on {}", env.tag(), config.vpn_address);
                inner.stream.publish(LabEvent::EnvironmentReady {
                    event_tag: env.tag().to_string(),
                });
            }
        }
        Err(e) => {
            error!("Failed to set up environment {}: {}", env.tag(), e);
            inner.stream.publish(LabEvent::EnvironmentFailed {
                event_tag: env.tag().to_string(),
                reason: e.to_string(),
            });
            if env.begin_close().await {
                let teardown = inner.clone();
                inner
                    .teardown
                    .add_task_or_detach(close_environment(teardown, env));
            }
        }
    }
}

/// Create, start and register one lab
pub(crate) async fn provision_lab(inner: Arc<AgentInner>, env: Arc<Environment>, is_vpn: bool) {
    let lab_tag = env.next_lab_tag();

    // Checkpoint 1: nothing has been created yet
    if env.status().is_closing() {
        info!(
            "Environment {} is closing, skipping creation of lab {}",
            env.tag(),
            lab_tag
        );
        inner.stream.publish(LabEvent::LabFailed {
            event_tag: env.tag().to_string(),
            reason: format!("environment {} is closing", env.tag()),
        });
        return;
    }

    let (lab, vpn_configs) = match build_lab(&inner, &env, &lab_tag, is_vpn).await {
        Ok(built) => built,
        Err(e) => {
            error!("Failed to create lab {}: {}", lab_tag, e);
            inner.stream.publish(LabEvent::LabFailed {
                event_tag: env.tag().to_string(),
                reason: e.to_string(),
            });
            return;
        }
    };

    // Checkpoint 2: registration fails once the environment is closing
    if let Err(e) = env.register_lab(lab.clone()).await {
        warn!("Lab {} finished after close began, tearing it down: {}", lab_tag, e);
        if let Err(e) = teardown_lab(&inner, &env, &lab).await {
            error!("Failed to tear down unregistered lab {}: {}", lab_tag, e);
        }
        inner.stream.publish(LabEvent::LabFailed {
            event_tag: env.tag().to_string(),
            reason: e.to_string(),
        });
        return;
    }

    // Announced labs must already be in the stored snapshot
    inner.persist().await;

    let mut descriptor = lab.descriptor().await;
    descriptor.vpn_configs = vpn_configs;
    info!("Lab {} is ready", lab_tag);
    inner.stream.publish(LabEvent::LabReady(descriptor));
}

/// Create a lab, add the environment's exercises and start it
///
/// Anything created is torn down again if a later step fails.
async fn build_lab(
    inner: &AgentInner,
    env: &Environment,
    lab_tag: &str,
    is_vpn: bool,
) -> Result<(Arc<Lab>, Vec<String>)> {
    let config = env.config();
    let cancel = env.cancel_signal();
    let spec = LabSpec {
        tag: lab_tag.to_string(),
        event_tag: env.tag().to_string(),
        lab_type: config.lab_type,
        is_vpn,
        frontends: config.frontends.clone(),
    };

    let lab = Arc::new(
        Lab::create(
            spec,
            inner.collab.provisioner.clone(),
            inner.collab.dns.clone(),
            cancel,
        )
        .await?,
    );

    let result = async {
        lab.add_exercises(config.exercises.clone()).await?;
        lab.refresh_dns().await?;
        lab.start(cancel).await?;
        if is_vpn {
            create_vpn_configs(inner, env, &lab).await
        } else {
            Ok(Vec::new())
        }
    }
    .await;

    match result {
        Ok(vpn_configs) => Ok((lab, vpn_configs)),
        Err(e) => {
            if let Err(teardown) = teardown_lab(inner, env, &lab).await {
                warn!("Cleanup of failed lab {} incomplete: {}", lab_tag, teardown);
            }
            Err(e)
        }
    }
}

/// Allocate client addresses, isolate the lab and render client configs
///
/// Only succeeds once per lab. If a peer cannot be registered, everything
/// issued so far is revoked.
pub(crate) async fn create_vpn_configs(
    inner: &AgentInner,
    env: &Environment,
    lab: &Lab,
) -> Result<Vec<String>> {
    let config = env.config();
    let handle = lab.handle();
    let ips = env
        .issue_vpn_access(&inner.rules, lab.tag(), handle.subnet)
        .await?;

    let mut configs = Vec::with_capacity(ips.len());
    for ip in &ips {
        match inner.collab.vpn.register_peer(env.tag(), *ip).await {
            Ok(credentials) => {
                let client = ClientConfig::new(
                    *ip,
                    credentials,
                    &inner.config.host,
                    config.vpn_port,
                    config.vpn_address,
                    handle.subnet,
                )
                .with_dns(handle.dns_address);
                configs.push(client.render());
            }
            Err(e) => {
                error!("Failed to register VPN peer {} for lab {}: {}", ip, lab.tag(), e);
                if let Err(revoke) = revoke_vpn_access(inner, env, lab.tag()).await {
                    warn!("Rollback of VPN access for lab {} incomplete: {}", lab.tag(), revoke);
                }
                return Err(e.into());
            }
        }
    }

    debug!("Generated {} VPN configs for lab {}", configs.len(), lab.tag());
    Ok(configs)
}

/// Remove a lab's isolation rules, client addresses and peers
async fn revoke_vpn_access(inner: &AgentInner, env: &Environment, lab_tag: &str) -> Result<()> {
    let (rule, ips) = env.take_vpn_access(lab_tag).await;
    let mut failures = Failures::new();

    if let Some(rule) = rule {
        if let Err(e) = inner.rules.revoke(lab_tag, &rule).await {
            failures.push(lab_tag, e);
        }
    }

    for ip in ips {
        if let Err(e) = inner.collab.vpn.remove_peer(env.tag(), ip).await {
            warn!("Failed to remove VPN peer {} of lab {}: {}", ip, lab_tag, e);
            failures.push(ip.to_string(), e);
        }
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(Error::Teardown(failures))
    }
}

/// Tear down a lab that is no longer in the index
pub(crate) async fn teardown_lab(inner: &AgentInner, env: &Environment, lab: &Lab) -> Result<()> {
    let mut failures = Failures::new();

    if let Err(e) = revoke_vpn_access(inner, env, lab.tag()).await {
        match e {
            Error::Teardown(more) => failures.extend(more),
            other => failures.push(lab.tag(), other),
        }
    }

    if let Err(e) = lab.close().await {
        match e {
            Error::Teardown(more) => failures.extend(more),
            other => failures.push(lab.tag(), other),
        }
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(Error::Teardown(failures))
    }
}

/// Teardown job for one closed lab
pub(crate) async fn close_lab(inner: Arc<AgentInner>, env: Arc<Environment>, lab: Arc<Lab>) {
    match teardown_lab(&inner, &env, &lab).await {
        Ok(()) => info!("Lab {} torn down", lab.tag()),
        Err(e) => error!("Teardown of lab {} incomplete: {}", lab.tag(), e),
    }
    inner.persist().await;
}

/// Teardown job for a closing environment
///
/// Waits for the environment's provisioning jobs to finish, then removes
/// every lab, the VPN interface and the VPN address.
pub(crate) async fn close_environment(inner: Arc<AgentInner>, env: Arc<Environment>) {
    env.pool().shutdown().await;

    for lab in env.drain_labs().await {
        if let Err(e) = teardown_lab(&inner, &env, &lab).await {
            error!("Teardown of lab {} incomplete: {}", lab.tag(), e);
        }
    }

    if let Err(e) = inner.collab.vpn.close_interface(env.tag()).await {
        warn!("Failed to close VPN interface of {}: {}", env.tag(), e);
    }
    inner.vpn_pool.release(env.config().vpn_address);

    env.advance(EnvironmentStatus::Closed);
    inner.registry.remove(env.tag());
    info!("Environment {} closed", env.tag());
    inner.persist().await;
}
