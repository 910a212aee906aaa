/*!
# Fluid DevKit - Outils de test pour le plan de contrôle

Bibliothèque facilitant les tests de bout en bout sans hyperviseur :
- Faux managers (VM, réseau, overlays, images, VMs sources) qui enregistrent
  les appels et acceptent des pannes injectées
- Harness reliant un kernel et un agent en mémoire par des canaux
*/

pub mod fakes;
pub mod harness;

pub use fakes::{CallLog, Failures, FakeHost};
pub use harness::{AgentHandle, KernelHarness, TEST_ORG, TEST_TOKEN};

/// Logs de test (RUST_LOG), sans erreur si déjà initialisés
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
