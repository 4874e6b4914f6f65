//! Flow-line demo scenario.
//!
//! Jobs arrive over time, draw raw material from a container, compete
//! for a pool of machines by priority, and deposit finished parts into a
//! store. A monitor samples the store level while the line runs. With a
//! fixed seed the run is fully deterministic.

use std::cell::RefCell;
use std::fs;
use std::rc::Rc;

use clap::Parser;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use eventide::core::env::Environment;
use eventide::core::value::Value;
use eventide::resources::container::Container;
use eventide::resources::priority::PriorityResource;
use eventide::resources::store::Store;
use eventide::util;

#[derive(Parser, Debug)]
#[command(name = "flowline", about = "Run the flow-line demo scenario")]
struct Args {
    /// Optional TOML scenario file; flags below override it
    #[arg(long)]
    config: Option<String>,

    /// Number of jobs to feed into the line
    #[arg(long)]
    jobs: Option<usize>,

    /// Number of machines in the pool
    #[arg(long)]
    machines: Option<usize>,

    /// RNG seed
    #[arg(long)]
    seed: Option<u64>,

    /// Virtual time horizon
    #[arg(long)]
    until: Option<f64>,

    /// Emit the summary as JSON instead of plain text
    #[arg(long)]
    json: bool,
}

/// Scenario parameters. Tuned so the default run has visible queueing
/// without starving the material container.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct Scenario {
    jobs: usize,
    machines: usize,
    seed: u64,
    /// Mean spacing between job arrivals
    mean_interarrival: f64,
    /// Mean machine service time
    mean_service: f64,
    /// Material drawn per job
    material_per_job: f64,
    material_capacity: f64,
    initial_material: f64,
    /// Material delivered per refill
    refill_amount: f64,
    refill_interval: f64,
    until: f64,
}

impl Default for Scenario {
    fn default() -> Self {
        Scenario {
            jobs: 50,
            machines: 2,
            seed: 42,
            mean_interarrival: 1.0,
            mean_service: 1.8,
            material_per_job: 2.0,
            material_capacity: 100.0,
            initial_material: 40.0,
            refill_amount: 20.0,
            refill_interval: 10.0,
            until: 200.0,
        }
    }
}

impl Scenario {
    fn validate(&self) -> Result<(), String> {
        if self.jobs == 0 || self.machines == 0 {
            return Err("jobs and machines must be positive".into());
        }
        if self.mean_interarrival <= 0.0 || self.mean_service <= 0.0 {
            return Err("mean times must be positive".into());
        }
        if self.initial_material > self.material_capacity {
            return Err(format!(
                "initial_material ({}) exceeds material_capacity ({})",
                self.initial_material, self.material_capacity
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct Summary {
    finished_jobs: usize,
    sim_time: f64,
    machine_utilization: f64,
    average_wait: f64,
    material_left: f64,
    store_samples: Vec<usize>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "eventide=info".into()),
        )
        .init();

    let args = Args::parse();
    let mut scenario = match &args.config {
        Some(path) => toml::from_str(&fs::read_to_string(path)?)?,
        None => Scenario::default(),
    };
    if let Some(jobs) = args.jobs {
        scenario.jobs = jobs;
    }
    if let Some(machines) = args.machines {
        scenario.machines = machines;
    }
    if let Some(seed) = args.seed {
        scenario.seed = seed;
    }
    if let Some(until) = args.until {
        scenario.until = until;
    }
    scenario.validate().map_err(std::io::Error::other)?;

    tracing::info!(
        "flow line: {} jobs, {} machines, seed {}",
        scenario.jobs,
        scenario.machines,
        scenario.seed
    );

    let summary = run_scenario(&scenario)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("=== FLOW LINE ===");
        println!("finished jobs:        {}", summary.finished_jobs);
        println!("simulated time:       {:.1}", summary.sim_time);
        println!("machine utilization:  {:.1}%", summary.machine_utilization * 100.0);
        println!("average machine wait: {:.2}", summary.average_wait);
        println!("material left:        {:.1}", summary.material_left);
        println!("store samples:        {:?}", summary.store_samples);
    }
    Ok(())
}

fn run_scenario(scenario: &Scenario) -> Result<Summary, Box<dyn std::error::Error>> {
    let env = Environment::new();
    let material = Container::new(
        &env,
        scenario.material_capacity,
        scenario.initial_material,
    )?;
    let machines = PriorityResource::new(&env, scenario.machines)?;
    let finished = Store::new(&env, scenario.jobs.max(1))?;
    let rng = Rc::new(RefCell::new(ChaCha8Rng::seed_from_u64(scenario.seed)));

    // Periodic material deliveries.
    {
        let material = material.clone();
        let amount = scenario.refill_amount;
        util::every(&env, scenario.refill_interval, move || {
            // Queues if the container is full; the amount is validated
            // at startup, so the call itself cannot fail.
            let _ = material.put(amount);
        })?;
    }

    // Job source: spawns one process per job with jittered interarrival
    // times and a random priority class.
    {
        let env_handle = env.clone();
        let material = material.clone();
        let machines = machines.clone();
        let finished = finished.clone();
        let rng = rng.clone();
        let cfg = scenario.clone();
        env.process(move |ctx| async move {
            for job in 0..cfg.jobs {
                let gap = {
                    let mut rng = rng.borrow_mut();
                    rng.gen_range(0.5..1.5) * cfg.mean_interarrival
                };
                ctx.hold(gap)?.await?;

                let (priority, service) = {
                    let mut rng = rng.borrow_mut();
                    (
                        rng.gen_range(0..3),
                        rng.gen_range(0.5..1.5) * cfg.mean_service,
                    )
                };
                let material = material.clone();
                let machines = machines.clone();
                let finished = finished.clone();
                let per_job = cfg.material_per_job;
                env_handle.process(move |ctx| async move {
                    ctx.wait(material.get(per_job)?.event()).await?;

                    let slot = machines.request(priority);
                    ctx.wait(slot.event()).await?;
                    ctx.hold(service)?.await?;
                    let release = machines.release(&slot)?;
                    ctx.wait(release.event()).await?;

                    ctx.wait(finished.put(Value::from(job)).event()).await?;
                    Ok(Value::None)
                });
            }
            Ok(Value::None)
        });
    }

    // Sample the finished-store level once per ten time units.
    let samples = Rc::new(RefCell::new(Vec::new()));
    {
        let finished = finished.clone();
        let samples = samples.clone();
        util::monitor(
            &env,
            10.0,
            move || finished.item_count(),
            move |n| samples.borrow_mut().push(n),
        )?;
    }

    env.run_until_time(scenario.until)?;

    let store_samples = samples.borrow().clone();
    Ok(Summary {
        finished_jobs: finished.item_count(),
        sim_time: env.now(),
        machine_utilization: machines.utilization(),
        average_wait: machines.average_wait(),
        material_left: material.level(),
        store_samples,
    })
}
