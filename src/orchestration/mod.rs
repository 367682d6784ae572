pub mod enrichment_orchestrator;

pub use enrichment_orchestrator::EnrichmentOrchestrator;
