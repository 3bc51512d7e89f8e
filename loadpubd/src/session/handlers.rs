//! Per-event handlers of the session state machine.
//!
//! A handler issues its statements first and mutates [`SessionContext`] only
//! once all of them succeeded, so a retried attempt starts from the same
//! state. Events whose preconditions are not met are skipped.

use loadpub_common::protocol::{
    Event, EventHeader, MonitorConfiguration, MonitorEventKind, MonitorMetrics, RequestResults,
    StressTestSettings, TestEvent, TestEventKind,
};
use loadpub_common::render::{format_timestamp_ms, render_metric_row};
use loadpub_common::types::Readiness;
use loadpub_store::Gateway;
use tracing::{debug, trace};

use super::statements;
use super::{SessionContext, SessionError, SessionSettings};
use crate::retry::wait_until;

/// Name of the stress-test row recorded for a distributed test.
pub const DISTRIBUTED_TEST_NAME: &str = "Distributed test";

/// Whether `event` can touch the store at all.
pub(crate) fn persists(event: &Event) -> bool {
    match event {
        Event::Poll(_)
        | Event::FastConcurrencyResults(_)
        | Event::FastRunResults(_)
        | Event::ClientMonitorMetrics(_)
        | Event::ApplicationLogEntry(_) => false,
        Event::TestEvent(e) => !matches!(
            e.kind,
            TestEventKind::TestInitialized
                | TestEventKind::RunDoneOnce
                | TestEventKind::RerunDone
                | TestEventKind::TestValue
                | TestEventKind::MasterListeningError
        ),
        Event::MonitorEvent(e) => matches!(
            e.kind,
            MonitorEventKind::MonitorAfterTestStarted | MonitorEventKind::MonitorAfterTestDone
        ),
        _ => true,
    }
}

/// Apply one event. Safe to call again after an error.
pub(crate) fn apply(
    ctx: &mut SessionContext,
    gateway: &mut dyn Gateway,
    settings: &SessionSettings,
    event: &Event,
) -> Result<(), SessionError> {
    match event {
        Event::DistributedTestConfiguration(c) => configure(
            ctx,
            gateway,
            settings,
            &c.header,
            Some((c.description.as_str(), c.tags.as_slice())),
            DISTRIBUTED_TEST_NAME,
            &c.run_synchronization,
            &StressTestSettings::default(),
        ),
        Event::StressTestConfiguration(c) => configure(
            ctx,
            gateway,
            settings,
            &c.header,
            Some((c.description.as_str(), c.tags.as_slice())),
            &c.stress_test,
            "None",
            &c.settings,
        ),
        Event::TileStressTestConfiguration(c) => configure(
            ctx,
            gateway,
            settings,
            &c.header,
            None,
            &c.tile_stress_test,
            &c.run_synchronization,
            &c.settings,
        ),
        Event::TestEvent(e) => test_event(ctx, gateway, e),
        Event::RequestResults(r) => request_results(ctx, gateway, r),
        Event::MonitorConfiguration(m) => monitor_configuration(ctx, gateway, settings, m),
        Event::MonitorEvent(e) => match e.kind {
            MonitorEventKind::MonitorAfterTestStarted => set_readiness(gateway, Readiness::NotReady),
            MonitorEventKind::MonitorAfterTestDone => set_readiness(gateway, Readiness::Ready),
            _ => Ok(()),
        },
        Event::MonitorMetrics(m) => monitor_metrics(ctx, gateway, m),
        Event::Poll(_)
        | Event::FastConcurrencyResults(_)
        | Event::FastRunResults(_)
        | Event::ClientMonitorMetrics(_)
        | Event::ApplicationLogEntry(_) => Ok(()),
    }
}

#[allow(clippy::too_many_arguments)]
fn configure(
    ctx: &mut SessionContext,
    gateway: &mut dyn Gateway,
    settings: &SessionSettings,
    header: &EventHeader,
    description_and_tags: Option<(&str, &[String])>,
    name: &str,
    run_synchronization: &str,
    stress_test: &StressTestSettings,
) -> Result<(), SessionError> {
    let instance_id = upsert_agent_instance(gateway, header)?;

    if let Some((description, tags)) = description_and_tags {
        gateway.execute(&statements::delete_descriptions())?;
        gateway.execute(&statements::delete_tags())?;
        if !description.is_empty() {
            gateway.execute(&statements::insert_description(description))?;
        }
        if !tags.is_empty() {
            gateway.execute(&statements::insert_tags(tags))?;
        }
    }

    let sealed = settings.sealer.seal(&stress_test.connection_string)?;
    let test_id = gateway.insert(&statements::insert_stress_test(
        instance_id,
        name,
        run_synchronization,
        stress_test,
        &sealed,
    ))?;

    debug!(instance_id, test_id, stress_test = name, "Stress test registered");
    ctx.instance_id = Some(instance_id);
    ctx.test_id = Some(test_id);
    Ok(())
}

fn upsert_agent_instance(gateway: &mut dyn Gateway, header: &EventHeader) -> Result<i64, SessionError> {
    let rows = gateway.query(&statements::find_agent_instance(header))?;
    if let Some(id) = rows.first().and_then(|row| row.first()).and_then(|v| v.as_i64()) {
        return Ok(id);
    }
    Ok(gateway.insert(&statements::insert_agent_instance(header))?)
}

fn required<'a>(event: &'a TestEvent, name: &'static str) -> Result<&'a str, SessionError> {
    event
        .parameter(name)
        .ok_or(SessionError::MissingParameter { name })
}

fn required_i64(event: &TestEvent, name: &'static str) -> Result<i64, SessionError> {
    let raw = required(event, name)?;
    raw.trim()
        .parse()
        .map_err(|_| SessionError::InvalidParameter {
            name,
            value: raw.to_string(),
        })
}

fn skipped(kind: impl std::fmt::Display, missing: &str) -> Result<(), SessionError> {
    debug!(%kind, missing, "Precondition not met, event skipped");
    Ok(())
}

fn test_event(
    ctx: &mut SessionContext,
    gateway: &mut dyn Gateway,
    event: &TestEvent,
) -> Result<(), SessionError> {
    let at = format_timestamp_ms(event.at_ms);

    match event.kind {
        TestEventKind::TestStarted => {
            let Some(test_id) = ctx.test_id else {
                return skipped(event.kind, "test");
            };
            let id = gateway.insert(&statements::insert_stress_test_result(test_id, &at))?;
            ctx.stress_test_result_id = Some(id);
        }
        TestEventKind::ConcurrencyStarted => {
            let Some(stress_test_result_id) = ctx.stress_test_result_id else {
                return skipped(event.kind, "stress test result");
            };
            let concurrency = required_i64(event, "Concurrency")?;
            let id = gateway.insert(&statements::insert_concurrency_result(
                stress_test_result_id,
                concurrency,
                &at,
            ))?;
            ctx.concurrency_result_id = Some(id);
        }
        TestEventKind::RunInitializedFirstTime => {
            ctx.pending_run = Some(required_i64(event, "Run")?);
        }
        TestEventKind::RunStarted => {
            let Some(concurrency_result_id) = ctx.concurrency_result_id else {
                return skipped(event.kind, "concurrency result");
            };
            let run = ctx.pending_run.unwrap_or(0);
            let id = gateway.insert(&statements::insert_run_result(concurrency_result_id, run, &at))?;
            ctx.run_result_id = Some(id);
            ctx.request_count = 0;
        }
        TestEventKind::RunStopped => {
            let Some(run_result_id) = ctx.run_result_id else {
                return skipped(event.kind, "run result");
            };
            gateway.execute(&statements::finish_run_result(
                run_result_id,
                ctx.request_count,
                &at,
            ))?;
            debug!(run_result_id, requests = ctx.request_count, "Run stopped");
            ctx.request_count = 0;
        }
        TestEventKind::ConcurrencyStopped => {
            let Some(concurrency_result_id) = ctx.concurrency_result_id else {
                return skipped(event.kind, "concurrency result");
            };
            gateway.execute(&statements::finish_concurrency_result(concurrency_result_id, &at))?;
        }
        TestEventKind::TestStopped => {
            if let Some(stress_test_result_id) = ctx.stress_test_result_id {
                let status = required(event, "Status")?;
                let message = event.parameter("StatusMessage").unwrap_or_default();
                gateway.execute(&statements::finish_stress_test_result(
                    stress_test_result_id,
                    &at,
                    status,
                    message,
                ))?;
            }
            if event.header.agent_is_master {
                set_readiness(gateway, Readiness::Ready)?;
            }
        }
        TestEventKind::TestMessage => {
            let Some(instance_id) = ctx.instance_id else {
                return skipped(event.kind, "agent instance");
            };
            let level = required_i64(event, "Level")?;
            let message = required(event, "Message")?;
            let timestamp = format_timestamp_ms(event.header.published_at_ms);
            gateway.execute(&statements::insert_message(instance_id, &timestamp, level, message))?;
        }
        TestEventKind::TestInitialized
        | TestEventKind::RunDoneOnce
        | TestEventKind::RerunDone
        | TestEventKind::TestValue
        | TestEventKind::MasterListeningError => {}
    }
    Ok(())
}

fn request_results(
    ctx: &mut SessionContext,
    gateway: &mut dyn Gateway,
    result: &RequestResults,
) -> Result<(), SessionError> {
    let Some(run_result_id) = ctx.run_result_id else {
        return skipped("RequestResults", "run result");
    };
    // Results without a virtual user are counted but not stored.
    if let Some(virtual_user) = result.virtual_user.as_deref() {
        gateway.execute(&statements::insert_request_result(
            run_result_id,
            virtual_user,
            result,
        ))?;
    }
    ctx.request_count += 1;
    trace!(run_result_id, count = ctx.request_count, "Request result stored");
    Ok(())
}

fn monitor_configuration(
    ctx: &mut SessionContext,
    gateway: &mut dyn Gateway,
    settings: &SessionSettings,
    monitor: &MonitorConfiguration,
) -> Result<(), SessionError> {
    let Some(test_id) = ctx.test_id else {
        return skipped("MonitorConfiguration", "test");
    };

    let lookup = statements::stress_test_visible(test_id);
    let visible = wait_until(
        settings.visibility_interval,
        settings.visibility_limit,
        &*settings.sleep,
        || gateway.query(&lookup).map(|rows| !rows.is_empty()),
    )?;
    if !visible {
        return Err(SessionError::NotVisible {
            test_id,
            polls: settings.visibility_limit.unwrap_or_default(),
        });
    }

    let sealed = settings.sealer.seal(&monitor.connection_string)?;
    let monitor_id = gateway.insert(&statements::insert_monitor(
        test_id,
        &monitor.monitor,
        &monitor.monitor_source,
        &sealed,
        monitor.hardware_configuration.as_deref().unwrap_or_default(),
    ))?;

    debug!(monitor = %monitor.monitor, monitor_id, "Monitor registered");
    ctx.monitors_missing_headers.insert(monitor.monitor.clone());
    ctx.monitor_ids.insert(monitor.monitor.clone(), monitor_id);
    Ok(())
}

fn monitor_metrics(
    ctx: &mut SessionContext,
    gateway: &mut dyn Gateway,
    metrics: &MonitorMetrics,
) -> Result<(), SessionError> {
    if ctx.test_id.is_none() {
        return skipped("MonitorMetrics", "test");
    }
    let Some(&monitor_id) = ctx.monitor_ids.get(&metrics.monitor) else {
        debug!(monitor = %metrics.monitor, "Metrics for unknown monitor skipped");
        return Ok(());
    };

    let register_headers = ctx.monitors_missing_headers.contains(&metrics.monitor);
    if register_headers {
        gateway.execute(&statements::set_monitor_headers(monitor_id, &metrics.headers))?;
    }

    gateway.execute(&statements::insert_monitor_result(
        monitor_id,
        &format_timestamp_ms(metrics.at_ms),
        &render_metric_row(&metrics.values),
    ))?;

    if register_headers {
        ctx.monitors_missing_headers.remove(&metrics.monitor);
    }
    Ok(())
}

fn set_readiness(gateway: &mut dyn Gateway, readiness: Readiness) -> Result<(), SessionError> {
    for statement in statements::set_readiness(readiness) {
        gateway.execute(&statement)?;
    }
    debug!(state = readiness.as_stored(), "Readiness updated");
    Ok(())
}
