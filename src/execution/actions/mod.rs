//! Built-in actions.

pub mod command;
pub mod ddl;
pub mod notify;
pub mod sensor;
pub mod spark;

pub use command::{CommandAction, CommandActionBuilder, CommandOutput};
pub use ddl::DdlAction;
pub use notify::{EmailAction, SLACK_API_URL, SlackAction};
pub use sensor::{Condition, FileExists, SensorAction};
pub use spark::{SparkSubmitAction, SparkSubmitBuilder};
