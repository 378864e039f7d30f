use std::sync::Arc;

use crate::{
    channel::OutboundChannel, delivery::DeliveryPipeline, remediation::RemediationOrchestrator,
    supervisor::ProcessSupervisor,
};

pub struct AppState {
    pub supervisor: Arc<ProcessSupervisor>,
    pub pipeline: Arc<DeliveryPipeline>,
    pub remediation: Arc<RemediationOrchestrator>,
    pub channel: Arc<dyn OutboundChannel>,
}
