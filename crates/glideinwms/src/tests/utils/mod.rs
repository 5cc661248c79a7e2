pub(crate) mod ads;
pub(crate) mod env;

pub(crate) use ads::{EntryAdBuilder, SlotBuilder, factory_global_ad, idle_job, running_job};
pub(crate) use env::{FACTORY_IDENTITY, FRONTEND_IDENTITY, FrontendEnv};
