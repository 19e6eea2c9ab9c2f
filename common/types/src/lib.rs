mod event;
mod group;
mod person;
mod team;
pub mod timestamp;

// Events
pub use event::ClickHouseEvent;
pub use event::PersonMode;
pub use event::RawEvent;

// Teams
pub use team::ProjectId;
pub use team::Team;
pub use team::TeamId;

// Persons
pub use person::Person;
pub use person::PersonId;

// Groups
pub use group::GroupType;

pub mod format {
    pub use crate::formats::format_ch_datetime;
    pub use crate::formats::parse_datetime_assuming_utc;
    pub use crate::formats::CH_FORMAT;
}

mod formats;
