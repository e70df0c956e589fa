use crate::gateway::StatusGateway;
use crate::orchestrator::Orchestrator;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Orchestrator,
    pub gateway: StatusGateway,
}

impl AppState {
    pub fn new(orchestrator: Orchestrator) -> Self {
        let gateway = StatusGateway::new(orchestrator.ledger().clone());
        Self {
            orchestrator,
            gateway,
        }
    }
}
