//! Simulated instruments.
//!
//! `sim_meter` is a deterministic meter whose reading can be set from the
//! script. `sim_fault` kills the process that calls `sim_fault_abort()`
//! during a real run, which is how the supervisor's handling of a worker
//! that dies without reporting is exercised.

use tracing::{debug, info};

use super::{Device, DeviceCatalog};
use crate::error::{DeviceError, DeviceResult};
use crate::interpreter::{RunMode, Value};

/// Register the simulated modules with `catalog`.
pub fn register(catalog: &DeviceCatalog) {
    catalog.register_default::<SimMeter>(SimMeter::NAME);
    catalog.register_default::<SimFault>(SimFault::NAME);
}

/// Meter returning a settable reading plus a small drift per read.
#[derive(Debug, Default)]
pub struct SimMeter {
    reading: f64,
    reads: u64,
}

impl SimMeter {
    /// Catalog name.
    pub const NAME: &'static str = "sim_meter";
    /// Drift added by every read.
    pub const DRIFT: f64 = 0.001;
}

impl Device for SimMeter {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn functions(&self) -> &[&'static str] {
        &["sim_meter_read", "sim_meter_set"]
    }

    fn call(&mut self, function: &str, args: &[Value], mode: RunMode) -> DeviceResult<Value> {
        let error = |message: String| DeviceError::Call {
            module: Self::NAME.to_string(),
            message,
        };
        match (function, args) {
            ("sim_meter_read", []) => {
                let value = self.reading + self.reads as f64 * Self::DRIFT;
                self.reads += 1;
                debug!(?mode, value, "meter read");
                Ok(Value::Float(value))
            }
            ("sim_meter_set", [value]) => {
                self.reading = value.as_f64().ok_or_else(|| {
                    error(format!("cannot set reading to a {}", value.type_name()))
                })?;
                self.reads = 0;
                Ok(Value::Float(self.reading))
            }
            ("sim_meter_read" | "sim_meter_set", _) => Err(error(format!(
                "wrong number of arguments ({}) for '{function}'",
                args.len()
            ))),
            _ => Err(error(format!("no function '{function}'"))),
        }
    }

    fn test_hook(&mut self) -> DeviceResult<()> {
        self.reading = 0.0;
        self.reads = 0;
        Ok(())
    }

    fn exp_hook(&mut self) -> DeviceResult<()> {
        info!("sim_meter ready");
        self.test_hook()
    }
}

/// Instrument whose only function crashes the calling process.
#[derive(Debug, Default)]
pub struct SimFault;

impl SimFault {
    /// Catalog name.
    pub const NAME: &'static str = "sim_fault";
}

impl Device for SimFault {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn functions(&self) -> &[&'static str] {
        &["sim_fault_abort"]
    }

    fn call(&mut self, function: &str, _args: &[Value], mode: RunMode) -> DeviceResult<Value> {
        match (function, mode) {
            ("sim_fault_abort", RunMode::Test) => Ok(Value::Int(0)),
            ("sim_fault_abort", RunMode::Real) => {
                tracing::error!("sim_fault_abort: aborting process");
                std::process::abort()
            }
            _ => Err(DeviceError::Call {
                module: Self::NAME.to_string(),
                message: format!("no function '{function}'"),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meter_drifts_from_set_point() {
        let mut meter = SimMeter::default();
        meter
            .call("sim_meter_set", &[Value::Int(2)], RunMode::Test)
            .unwrap();
        assert_eq!(
            meter.call("sim_meter_read", &[], RunMode::Test).unwrap(),
            Value::Float(2.0)
        );
        assert_eq!(
            meter.call("sim_meter_read", &[], RunMode::Test).unwrap(),
            Value::Float(2.0 + SimMeter::DRIFT)
        );
        assert!(meter.call("sim_meter_read", &[Value::Int(1)], RunMode::Test).is_err());
        assert!(meter
            .call("sim_meter_set", &[Value::Str("x".into())], RunMode::Test)
            .is_err());
    }

    #[test]
    fn test_fault_is_harmless_in_test_run() {
        let mut fault = SimFault;
        assert_eq!(
            fault.call("sim_fault_abort", &[], RunMode::Test).unwrap(),
            Value::Int(0)
        );
    }
}
