pub mod keys;
pub mod model;
pub mod session;

pub use keys::{scoped_key, KeyFamily, KeyFamilyId, KeyScope};
pub use model::{
    average_efficiency, DashboardRollup, DashboardUpdate, DiagnosisBlockState, DiagnosisNote,
    QuestionnaireData, TaskRecord, Venue,
};
pub use session::Session;
