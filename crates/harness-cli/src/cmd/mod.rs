pub mod project;
pub mod redesign;
pub mod run;
pub mod serve;
