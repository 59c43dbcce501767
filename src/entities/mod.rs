//! Entity module - Contains all SeaORM entity definitions for the database.
//! These entities represent the database tables and their relationships.
//! Each entity has a Model struct for data and an Entity struct for operations.

pub mod course;
pub mod course_schedule;
pub mod enrollment;
pub mod notification;
pub mod payment;
pub mod payment_enrollment;

// Re-export specific types to avoid conflicts
pub use course::{Column as CourseColumn, Entity as Course, Model as CourseModel};
pub use course_schedule::{
    Column as CourseScheduleColumn, Entity as CourseSchedule, Model as CourseScheduleModel,
};
pub use enrollment::{
    Column as EnrollmentColumn, Entity as Enrollment, EnrollmentState, Model as EnrollmentModel,
};
pub use notification::{
    Column as NotificationColumn, Entity as Notification, Model as NotificationModel,
    NotificationKind,
};
pub use payment::{Column as PaymentColumn, Entity as Payment, Model as PaymentModel, PaymentStatus};
pub use payment_enrollment::{
    Column as PaymentEnrollmentColumn, Entity as PaymentEnrollment,
    Model as PaymentEnrollmentModel,
};
