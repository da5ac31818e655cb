//! Composition root: opens the hardware, hands each handle to exactly one
//! cycle, and runs every cycle as its own task.
//!
//! ```text
//! Starting ──▶ (Recovering ──▶) Running ──▶ Stopped
//!                                  │
//!                                  └──▶ Superseded   (process image replaced)
//! ```

use anyhow::{anyhow, bail, Context, Result};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::alert;
use crate::config::{self, Config, Settings};
use crate::gpio::Board;
use crate::light::LightCycle;
use crate::mqtt::Publisher;
use crate::pump::{AirPump, DutyCycle};
use crate::ranging::HcSr04;
use crate::sensors::{self, ClimateSensor, CpuThermal, TemperatureSensor, Unavailable};
use crate::state::SharedState;
use crate::telemetry::{SensorSuite, TelemetryCycle, WaterLevel};
use crate::watchdog::{Recovery, Watchdog};
use crate::window::{Clock, Schedule};

/// How long `stop` waits for the cycles before aborting them.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Lifecycle {
    Starting,
    Recovering,
    Running,
    Superseded,
    Stopped,
}

/// Opened hardware, not yet split between the cycles.
pub struct Hardware {
    pub board: Board,
    pub water: Box<dyn TemperatureSensor>,
    pub ambient: Box<dyn TemperatureSensor>,
    pub climate: Option<Box<dyn ClimateSensor>>,
    pub cpu: CpuThermal,
}

/// What the cycles should do with the hardware.
#[derive(Debug, Clone, Copy)]
pub struct Plan {
    pub schedule: Option<Schedule>,
    pub duty: DutyCycle,
    pub sensor_period: Duration,
    /// Low-water threshold in cm; `None` leaves the ranging sensor unused.
    pub low_water_cm: Option<f32>,
    pub echo_timeout: Duration,
    pub clock: Clock,
}

impl Plan {
    pub fn new(config: &Config, settings: &Settings, clock: Clock) -> Self {
        Self {
            schedule: config.schedule(),
            duty: config.duty_cycle(),
            sensor_period: config.sensor_period(),
            low_water_cm: config
                .water_level_enabled
                .then_some(config.low_water_distance_cm),
            echo_timeout: settings.echo_timeout,
            clock,
        }
    }
}

type CycleResult = (&'static str, Result<()>);

pub struct Orchestrator {
    tasks: JoinSet<CycleResult>,
    shutdown: CancellationToken,
    status: SharedState,
}

impl Orchestrator {
    /// Load config, open the hardware, connect, and launch every cycle.
    /// Returns once all cycles are running.
    pub async fn start(
        settings: &Settings,
        clock: Clock,
        publisher: Arc<dyn Publisher>,
        recovery: Arc<dyn Recovery>,
        status: SharedState,
        shutdown: &CancellationToken,
    ) -> Result<Self> {
        status.write().await.set_lifecycle(Lifecycle::Starting);

        let config = config::load_or_default(&settings.config_path);
        let board = Board::open(&config.pins).context("could not open gpio lines")?;

        let water = sensors::open_water(&config.water_temp_sensor_id).unwrap_or_else(|e| {
            warn!("water probe unavailable: {e:#}");
            Box::new(Unavailable::new("water", &e))
        });
        let ambient = sensors::open_ambient().unwrap_or_else(|e| {
            warn!("ambient sensor unavailable: {e:#}");
            Box::new(Unavailable::new("ambient", &e))
        });
        let climate = config.climate_sensor_enabled.then(|| {
            sensors::open_climate().unwrap_or_else(|e| {
                warn!("climate sensor unavailable: {e:#}");
                Box::new(Unavailable::new("climate", &e))
            })
        });

        let hardware = Hardware {
            board,
            water,
            ambient,
            climate,
            cpu: CpuThermal::new(&settings.cpu_temp_path),
        };
        let plan = Plan::new(&config, settings, clock);
        Self::launch(hardware, plan, publisher, recovery, status, shutdown.child_token()).await
    }

    pub async fn launch(
        hardware: Hardware,
        plan: Plan,
        publisher: Arc<dyn Publisher>,
        recovery: Arc<dyn Recovery>,
        status: SharedState,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let Hardware {
            board,
            water,
            ambient,
            climate,
            cpu,
        } = hardware;
        let Board {
            grow_light,
            air_pump,
            button,
            button_led,
            ping,
            echo,
        } = board;

        let mut watchdog = Watchdog::new(button, button_led, recovery, status.clone());
        if let Err(e) = publisher.connect().await {
            warn!("initial connection failed: {e:#}");
            if !watchdog.recover_at_startup(&shutdown).await {
                bail!("shutdown requested during startup recovery");
            }
            if let Err(e) = publisher.connect().await {
                warn!("still offline, telemetry will go out once the link returns: {e:#}");
            }
        }

        let (alerts, alert_rx) = alert::channel();

        let mut suite = SensorSuite::new(water, ambient, cpu, alerts.clone());
        match plan.low_water_cm {
            Some(threshold) => {
                let ranging = HcSr04::new(ping, echo, plan.echo_timeout);
                suite = suite.with_water_level(WaterLevel::new(ranging, threshold));
            }
            None => info!("water level sensing disabled, ranging lines released"),
        }
        if let Some(climate) = climate {
            suite = suite.with_climate(climate);
        }

        let mut tasks = JoinSet::new();

        let monitor = alert::monitor(alert_rx, status.clone(), shutdown.clone());
        spawn_cycle(&mut tasks, "fault-monitor", async move {
            monitor.await;
            Ok(())
        });
        spawn_cycle(
            &mut tasks,
            "light",
            LightCycle::new(grow_light, plan.schedule).run(plan.clock, status.clone(), shutdown.clone()),
        );
        spawn_cycle(
            &mut tasks,
            "air-pump",
            AirPump::new(air_pump, status.clone()).run(plan.duty, shutdown.clone()),
        );
        spawn_cycle(
            &mut tasks,
            "telemetry",
            TelemetryCycle {
                suite,
                publisher,
                alerts,
                status: status.clone(),
                period: plan.sensor_period,
            }
            .run(shutdown.clone()),
        );
        spawn_cycle(&mut tasks, "watchdog", watchdog.run(shutdown.clone()));

        {
            let mut st = status.write().await;
            st.set_lifecycle(Lifecycle::Running);
            st.record_system(format!("{} cycles running", tasks.len()));
        }
        info!(cycles = tasks.len(), "rig running");

        Ok(Self {
            tasks,
            shutdown,
            status,
        })
    }

    /// Resolves when a cycle fails. Cycles that end cleanly are skipped;
    /// with none left this never resolves. Cancel-safe.
    pub async fn fault(&mut self) -> anyhow::Error {
        loop {
            match self.tasks.join_next().await {
                None => return std::future::pending().await,
                Some(Ok((_, Ok(())))) => continue,
                Some(Ok((name, Err(e)))) => return e.context(format!("{name} cycle failed")),
                Some(Err(e)) => return anyhow!(e).context("cycle task panicked"),
            }
        }
    }

    /// Signal every cycle to stop and wait for them, bounded by
    /// [`STOP_TIMEOUT`].
    pub async fn stop(mut self) -> Result<()> {
        info!("stopping rig");
        self.shutdown.cancel();

        let tasks = &mut self.tasks;
        let drained = tokio::time::timeout(STOP_TIMEOUT, async {
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok((_, Ok(()))) => {}
                    Ok((name, Err(e))) => warn!(cycle = name, "cycle failed while stopping: {e:#}"),
                    Err(e) => warn!("cycle task panicked while stopping: {e}"),
                }
            }
        })
        .await
        .is_ok();

        let mut st = self.status.write().await;
        st.set_lifecycle(Lifecycle::Stopped);
        if drained {
            info!("rig stopped");
            Ok(())
        } else {
            self.tasks.abort_all();
            st.record_error(format!("cycles did not stop within {STOP_TIMEOUT:?}"));
            bail!("cycles did not stop within {STOP_TIMEOUT:?}, aborted")
        }
    }
}

fn spawn_cycle<F>(tasks: &mut JoinSet<CycleResult>, name: &'static str, cycle: F)
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    tasks.spawn(async move { (name, cycle.await) });
}

// ===========================================================================
// Tests
// ===========================================================================
