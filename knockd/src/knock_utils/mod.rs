pub mod capturing_frames;
pub mod inspecting_frames;
pub mod publishing_events;
pub mod receiving_knocks;
pub mod shared;
