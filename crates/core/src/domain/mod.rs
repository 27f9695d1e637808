pub mod action;
pub mod agent_run;
pub mod company;
pub mod event;
pub mod history;
pub mod metrics;
pub mod record;
pub mod team;
