use crate::core::{errors::GateRejection, traits::gate::Gate};

#[derive(Debug, Clone)]
pub struct GateStub {
    result: Result<(), GateRejection>,
}

impl GateStub {
    pub fn new(result: Result<(), GateRejection>) -> Self {
        Self { result }
    }

    pub fn allow_all() -> Self {
        Self::new(Ok(()))
    }
}

impl Gate for GateStub {
    #[tracing::instrument]
    fn check(&self, source: &str) -> Result<(), GateRejection> {
        tracing::debug!("Gate result: {:?}", self.result);
        self.result.clone()
    }
}
