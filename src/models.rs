pub mod claims;
pub mod memberships;
pub mod orders;
pub mod plans;
pub mod requests;
