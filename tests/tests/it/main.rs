mod aba;
mod acs;
mod acss;
mod adkg;
mod coin;
mod coordinator;
mod dss;
mod dss_node;
mod rbc;
