#![deny(warnings)]
use clap::{App, Arg};
use econcell::{AnalysisRequest, Config, Coordinator};
use model_pool::{ModelFamily, ModelOutput, ModelRuntime};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use std::time::{Duration, Instant};
use task_queue::{Outcome, Priority, TaskType};

/// Deterministic stand-in for a model backend. Every `drift_every`-th
/// execution disagrees with the others so consensus has something to do.
struct StubModel {
    latency: Duration,
    drift_every: usize,
    counter: AtomicUsize,
}

impl StubModel {
    fn new(latency: Duration, drift_every: usize) -> Self {
        StubModel {
            latency,
            drift_every,
            counter: AtomicUsize::new(0),
        }
    }
}

impl ModelRuntime for StubModel {
    fn load(&self) -> Result<(), String> {
        std::thread::sleep(self.latency * 4);
        Ok(())
    }

    fn execute(&self, payload: &str) -> Result<ModelOutput, String> {
        std::thread::sleep(self.latency);
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let answer = if self.drift_every > 0 && n % self.drift_every == self.drift_every - 1 {
            format!("{}: revise estimate", payload)
        } else {
            format!("{}: stable outlook", payload)
        };
        Ok(ModelOutput {
            answer,
            confidence: 0.85,
        })
    }

    fn ping(&self) -> bool {
        true
    }

    fn unload(&self) {}
}

fn main() {
    let matches = App::new("EconCell Bench")
        .about("An example driver for evaluating the orchestration core")
        .arg(
            Arg::with_name("requests")
                .short("n")
                .help("How many analysis requests to submit")
                .default_value("48")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("workers")
                .short("w")
                .help("Size of the coordinator worker pool")
                .default_value("4")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("latency_ms")
                .short("l")
                .help("Simulated per-execution latency in milliseconds")
                .default_value("3")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("consensus_threshold")
                .short("t")
                .help("Agreement below this flags a result for review")
                .default_value("0.7")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("config")
                .short("c")
                .help("Path to a JSON configuration file")
                .takes_value(true),
        )
        .get_matches();

    let mut builder = env_logger::Builder::from_default_env();
    builder.format_timestamp_micros().init();

    let requests: usize = matches.value_of("requests").unwrap().parse().unwrap();
    let latency = Duration::from_millis(matches.value_of("latency_ms").unwrap().parse().unwrap());
    let mut config = match matches.value_of("config") {
        Some(path) => Config::from_file(path).unwrap(),
        None => Config::default(),
    };
    config.workers = matches.value_of("workers").unwrap().parse().unwrap();
    config.consensus_threshold = matches
        .value_of("consensus_threshold")
        .unwrap()
        .parse()
        .unwrap();

    let coordinator = Coordinator::builder(config)
        .runtime(ModelFamily::Reasoning, move || {
            Box::new(StubModel::new(latency, 0))
        })
        .runtime(ModelFamily::Verification, move || {
            Box::new(StubModel::new(latency, 7))
        })
        .runtime(ModelFamily::Enrichment, move || {
            Box::new(StubModel::new(latency / 2, 0))
        })
        .start();
    println!("coordinator is ready");

    let types = [
        TaskType::DataAnalysis,
        TaskType::Forecasting,
        TaskType::HypothesisGeneration,
        TaskType::PolicyAnalysis,
        TaskType::DataEnrichment,
        TaskType::AnomalyDetection,
    ];
    let priorities = [
        Priority::Normal,
        Priority::High,
        Priority::Normal,
        Priority::Critical,
        Priority::Low,
        Priority::Batch,
    ];
    let start = Instant::now();
    let mut handles = vec![];
    for i in 0..requests {
        let payload: Arc<str> = Arc::from(format!("series-{}", i).as_str());
        let request = AnalysisRequest::new(types[i % types.len()], payload)
            .priority(priorities[i % priorities.len()]);
        handles.push(coordinator.submit(request).unwrap());
    }

    let mut done = 0;
    let mut failed = 0;
    let mut review = 0;
    let mut latencies = vec![];
    for handle in &handles {
        let report = coordinator.await_result(handle);
        latencies.push(report.latency);
        match report.outcome {
            Outcome::Completed(result) => {
                done += 1;
                if result.needs_review {
                    review += 1;
                }
            }
            Outcome::Failed(error) => {
                println!("request {} failed: {:?}", handle.id(), error);
                failed += 1;
            }
            Outcome::Cancelled => failed += 1,
        }
    }
    let elapsed = start.elapsed();
    latencies.sort();
    let mean: Duration = latencies.iter().sum::<Duration>() / latencies.len() as u32;
    let p95 = latencies[latencies.len() * 95 / 100];

    println!(
        "End of run done/failed/review {}/{}/{} in {:?}",
        done, failed, review, elapsed
    );
    println!("latency mean {:?} p95 {:?}", mean, p95);
    let status = coordinator.system_status();
    for (tier, usage) in &status.tiers {
        println!(
            "{:?}: {}/{} MB reserved",
            tier, usage.allocated, usage.capacity
        );
    }
    for instance in &status.instances {
        println!(
            "instance {} {:?} {:?} success {:.2} avg {:?}",
            instance.id,
            instance.family,
            instance.status,
            instance.success_rate,
            instance.average_latency
        );
    }
    println!(
        "queue completed/failed/timeout {}/{}/{} avg wait {:?} avg exec {:?}",
        status.queue.completed,
        status.queue.failed,
        status.queue.timed_out,
        status.queue.average_wait,
        status.queue.average_exec
    );
    coordinator.shutdown();
}
