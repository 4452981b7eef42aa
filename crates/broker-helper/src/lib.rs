//! Support library for the C6 helper driver (`bin/helperd`), the C7 reaper
//! (`bin/reaperd`), and the admin CLI (`bin/brokerctl`): map-entry
//! resolution and HSM action dispatch shared by the forked worker and the
//! CLI's synchronous request submission path.

pub mod hsm_actions;
pub mod resolve;
