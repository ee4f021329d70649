pub mod staker_identity;
