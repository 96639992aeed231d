/*
This crate is home to everything that talks to the IoT broker managing
the devices of this fleet.

It provides the mutually-authenticated MQTT session, the
fleet-provisioning handshake used to exchange a bootstrap certificate
for a permanent device identity, and the periodic telemetry reporting
loop together with its local metrics sampler.
*/

pub mod metrics;
pub mod provisioning;
pub mod session;
pub mod telemetry;
