pub mod participants;
