//! Dispatch driver: matches committed data against pipeline requirements and
//! invokes pipelines, single-threaded and cooperative.

use crate::client::DataClient;
use crate::error::{PipelineError, PipelineResult};
use crate::pipeline::{DataRequirements, Pipeline};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Shared stop flag handed to pipelines. A stop request takes effect at the
/// end of the current dispatch iteration, never mid-pipeline.
#[derive(Clone, Default)]
pub struct DriverControl {
    stop: Arc<AtomicBool>,
}

impl DriverControl {
    /// Requests the driver to stop after the current iteration completes.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Whether a stop has been requested.
    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }
}

struct Registration {
    requirements: DataRequirements,
    pipeline: Box<dyn Pipeline>,
}

/// Holds the registered (requirement-set, pipeline) pairs and runs the
/// dispatch loop.
///
/// Pipelines run to completion in registration order, uninterrupted, before
/// the next iteration begins. The only shared state crossing thread
/// boundaries is the buffers behind the data client; registrations and the
/// delivered map are owned here.
pub struct PipelineDriver {
    registrations: Vec<Registration>,
    control: DriverControl,
    permit_empty_cycles: bool,
}

impl PipelineDriver {
    /// Creates a driver. `permit_empty_cycles` selects whether a cycle that
    /// invokes no pipeline is logged and skipped or treated as fatal.
    pub fn new(permit_empty_cycles: bool) -> Self {
        Self {
            registrations: Vec::new(),
            control: DriverControl::default(),
            permit_empty_cycles,
        }
    }

    /// A clone of the stop flag, for callers outside the pipelines.
    pub fn control(&self) -> DriverControl {
        self.control.clone()
    }

    /// Registers and initializes a pipeline. A pipeline that requires no data
    /// at all can never be dispatched and is rejected here.
    pub fn register(&mut self, mut pipeline: Box<dyn Pipeline>) -> PipelineResult<()> {
        pipeline.init()?;
        let requirements = pipeline.required_data();
        if requirements.is_empty() {
            return Err(PipelineError::Configuration(format!(
                "pipeline '{}' declares no required data",
                pipeline.name()
            )));
        }
        info!(pipeline = pipeline.name(), "Registered pipeline");
        self.registrations.push(Registration {
            requirements,
            pipeline,
        });
        Ok(())
    }

    /// The requirement sets collected from all registrations, in registration
    /// order. Use these to construct a matching data client.
    pub fn data_requirements(&self) -> Vec<DataRequirements> {
        self.registrations
            .iter()
            .map(|r| r.requirements.clone())
            .collect()
    }

    /// Runs the dispatch loop until a stop is requested or a fatal error
    /// occurs. Validates registrations before the first iteration.
    pub fn start(&mut self, client: &mut dyn DataClient) -> PipelineResult<()> {
        if self.registrations.is_empty() {
            return Err(PipelineError::Configuration(
                "no pipelines registered".to_string(),
            ));
        }
        self.check_stream_overlap()?;

        info!(
            pipelines = self.registrations.len(),
            permit_empty_cycles = self.permit_empty_cycles,
            "Starting dispatch loop"
        );

        while !self.control.is_stopped() {
            let delivered = client.get_data()?;

            let mut ran_pipeline = false;
            for registration in &mut self.registrations {
                if registration.requirements.is_satisfied_by(&delivered) {
                    debug!(
                        pipeline = registration.pipeline.name(),
                        "Requirements satisfied, invoking"
                    );
                    registration.pipeline.run(&delivered, &self.control)?;
                    ran_pipeline = true;
                }
            }
            // Handles delivered this cycle are released here.
            drop(delivered);

            if !ran_pipeline {
                if self.permit_empty_cycles {
                    debug!("No pipeline ran this cycle");
                } else {
                    return Err(PipelineError::Dispatch(
                        "no pipeline was run this cycle and empty cycles are disallowed"
                            .to_string(),
                    ));
                }
            }
        }

        info!("Dispatch loop stopped");
        Ok(())
    }

    /// Stream data is never copied, so no two pipelines may require the same
    /// stream type. Checked once, before the loop runs.
    fn check_stream_overlap(&self) -> PipelineResult<()> {
        for (i, a) in self.registrations.iter().enumerate() {
            for b in &self.registrations[i + 1..] {
                if a.requirements.intersects_stream(&b.requirements) {
                    return Err(PipelineError::Configuration(format!(
                        "pipelines '{}' and '{}' require the same stream data",
                        a.pipeline.name(),
                        b.pipeline.name()
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::DeliveredData;
    use std::sync::atomic::AtomicUsize;

    struct CountingPipeline {
        name: String,
        requirements: DataRequirements,
        invocations: Arc<AtomicUsize>,
        stop_after: Option<usize>,
    }

    impl CountingPipeline {
        fn boxed(
            name: &str,
            requirements: DataRequirements,
            invocations: Arc<AtomicUsize>,
            stop_after: Option<usize>,
        ) -> Box<dyn Pipeline> {
            Box::new(Self {
                name: name.to_string(),
                requirements,
                invocations,
                stop_after,
            })
        }
    }

    impl Pipeline for CountingPipeline {
        fn name(&self) -> &str {
            &self.name
        }

        fn required_data(&self) -> DataRequirements {
            self.requirements.clone()
        }

        fn run(&mut self, _data: &DeliveredData, control: &DriverControl) -> PipelineResult<()> {
            let count = self.invocations.fetch_add(1, Ordering::SeqCst) + 1;
            if Some(count) == self.stop_after {
                control.stop();
            }
            Ok(())
        }
    }

    /// Client that reports a fixed set of available names each cycle.
    struct FixedClient {
        requirements: Vec<DataRequirements>,
        available: Vec<String>,
    }

    impl DataClient for FixedClient {
        fn data_requirements(&self) -> &[DataRequirements] {
            &self.requirements
        }

        fn get_data(&mut self) -> PipelineResult<DeliveredData> {
            let mut delivered = DeliveredData::new();
            for name in &self.available {
                delivered.insert(
                    name.clone(),
                    crate::pipeline::DeliveredChunk::Remote {
                        bytes: bytes::Bytes::from_static(b"chunk"),
                        version: 1,
                    },
                );
            }
            Ok(delivered)
        }
    }

    #[test]
    fn start_without_registrations_fails() {
        let mut driver = PipelineDriver::new(false);
        let mut client = FixedClient {
            requirements: vec![],
            available: vec![],
        };
        assert!(matches!(
            driver.start(&mut client),
            Err(PipelineError::Configuration(_))
        ));
    }

    #[test]
    fn empty_requirements_rejected_at_registration() {
        let mut driver = PipelineDriver::new(false);
        let counter = Arc::new(AtomicUsize::new(0));
        let result = driver.register(CountingPipeline::boxed(
            "idle",
            DataRequirements::new(),
            counter,
            None,
        ));
        assert!(matches!(result, Err(PipelineError::Configuration(_))));
    }

    #[test]
    fn overlapping_stream_requirements_fatal_before_loop() {
        let mut driver = PipelineDriver::new(true);
        let counter = Arc::new(AtomicUsize::new(0));
        driver
            .register(CountingPipeline::boxed(
                "p1",
                DataRequirements::new().with_stream("X"),
                Arc::clone(&counter),
                None,
            ))
            .expect("register p1");
        driver
            .register(CountingPipeline::boxed(
                "p2",
                DataRequirements::new().with_stream("X"),
                Arc::clone(&counter),
                None,
            ))
            .expect("register p2");

        let mut client = FixedClient {
            requirements: driver.data_requirements(),
            available: vec!["X".to_string()],
        };
        assert!(matches!(
            driver.start(&mut client),
            Err(PipelineError::Configuration(_))
        ));
        assert_eq!(
            counter.load(Ordering::SeqCst),
            0,
            "no pipeline may run before validation passes"
        );
    }

    #[test]
    fn unsatisfied_pipeline_not_invoked() {
        let mut driver = PipelineDriver::new(true);
        let satisfied = Arc::new(AtomicUsize::new(0));
        let starved = Arc::new(AtomicUsize::new(0));

        driver
            .register(CountingPipeline::boxed(
                "satisfied",
                DataRequirements::new().with_stream("a"),
                Arc::clone(&satisfied),
                Some(3),
            ))
            .expect("register");
        driver
            .register(CountingPipeline::boxed(
                "starved",
                DataRequirements::new().with_stream("b"),
                Arc::clone(&starved),
                None,
            ))
            .expect("register");

        let mut client = FixedClient {
            requirements: driver.data_requirements(),
            available: vec!["a".to_string()],
        };
        driver.start(&mut client).expect("runs until stop");

        assert_eq!(satisfied.load(Ordering::SeqCst), 3);
        assert_eq!(starved.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn empty_cycle_fatal_when_disallowed() {
        let mut driver = PipelineDriver::new(false);
        let counter = Arc::new(AtomicUsize::new(0));
        driver
            .register(CountingPipeline::boxed(
                "p1",
                DataRequirements::new().with_stream("wibble"),
                counter,
                None,
            ))
            .expect("register");

        let mut client = FixedClient {
            requirements: driver.data_requirements(),
            available: vec![],
        };
        assert!(matches!(
            driver.start(&mut client),
            Err(PipelineError::Dispatch(_))
        ));
    }

    #[test]
    fn stop_takes_effect_at_iteration_boundary() {
        let mut driver = PipelineDriver::new(true);
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        // The first pipeline requests a stop on its first run; the second,
        // registered after it, must still run in the same iteration.
        driver
            .register(CountingPipeline::boxed(
                "stopper",
                DataRequirements::new().with_stream("a"),
                Arc::clone(&first),
                Some(1),
            ))
            .expect("register");
        driver
            .register(CountingPipeline::boxed(
                "follower",
                DataRequirements::new().with_service("c"),
                Arc::clone(&second),
                None,
            ))
            .expect("register");

        let mut client = FixedClient {
            requirements: driver.data_requirements(),
            available: vec!["a".to_string(), "c".to_string()],
        };
        driver.start(&mut client).expect("stops cleanly");

        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }
}
