/*!
# FleetWatch DevKit - Simulation de postes pour le développement

Permet de faire tourner le kernel sans vrais PC de salle :
- Simulateur d'agent terminal (heartbeats, événements de statut, captures)
- Sink MQTT mocké pour tester sans broker
- Binaire `fleetwatch-sim` publiant une flotte simulée sur MQTT
*/

pub mod mqtt_stub;
pub mod simulator;

pub use mqtt_stub::{MessageSink, MockMqttClient};
pub use simulator::{AgentCommandIn, SimProfile, SimulatedFleet, TerminalSimulator};
