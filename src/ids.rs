//! Run and trace identifier generation.

use rand::Rng;
use rand::seq::SliceRandom;

const ADJECTIVES: &[&str] = &[
    "agile", "amber", "bold", "brave", "bright", "calm", "clever", "crisp", "daring", "deft",
    "eager", "fleet", "gentle", "happy", "keen", "lively", "lucid", "mellow", "nimble", "plucky",
    "proud", "quick", "quiet", "rapid", "sharp", "silent", "sleek", "smart", "snappy", "solid",
    "steady", "sturdy", "subtle", "swift", "tidy", "vivid", "warm", "wise", "witty", "zesty",
];

const ANIMALS: &[&str] = &[
    "badger", "bison", "condor", "coyote", "crane", "dolphin", "falcon", "ferret", "finch", "fox",
    "gazelle", "gecko", "heron", "ibex", "jackal", "jaguar", "koala", "lemur", "lynx", "macaw",
    "marmot", "marten", "mole", "newt", "ocelot", "orca", "osprey", "otter", "owl", "panda",
    "petrel", "puffin", "raven", "salmon", "stoat", "swift", "tapir", "toucan", "walrus", "wren",
];

/// Generates a human-readable run id like `quick-agile-lynx`.
///
/// Matches `^[a-z]+-[a-z]+-[a-z]+$`. Caller-supplied run ids bypass this and
/// are treated as opaque strings.
pub fn generate_run_id() -> String {
    let mut rng = rand::thread_rng();
    let mut adjectives = ADJECTIVES.choose_multiple(&mut rng, 2);
    let first = adjectives.next().unwrap_or(&"quick");
    let second = adjectives.next().unwrap_or(&"agile");
    let animal = ANIMALS.choose(&mut rng).unwrap_or(&"lynx");
    format!("{first}-{second}-{animal}")
}

/// Generates a 16-byte hex trace id threading target and evaluator spans of
/// one cell.
pub fn generate_trace_id() -> String {
    let bytes: [u8; 16] = rand::thread_rng().r#gen();
    let mut out = String::with_capacity(32);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}
