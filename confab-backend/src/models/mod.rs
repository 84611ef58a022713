mod activity;
mod agent;
mod identity;
mod points;
mod session;
mod sponsorship;

pub use activity::*;
pub use agent::*;
pub use identity::*;
pub use points::*;
pub use session::*;
pub use sponsorship::*;
