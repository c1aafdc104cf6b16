//! Shared UI icons.

use console::Emoji;

// Status indicators
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "[OK]");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "[ERR]");
pub static SPARKLE: Emoji<'_, '_> = Emoji("✨ ", "*");
pub static STOP: Emoji<'_, '_> = Emoji("⛔ ", "[STOP]");

// Pipeline indicators
pub static RUNNING: Emoji<'_, '_> = Emoji("▶️  ", "[>]");
pub static GATE: Emoji<'_, '_> = Emoji("🚧 ", "[GATE]");
pub static CLOCK: Emoji<'_, '_> = Emoji("⏱️  ", "[T]");
