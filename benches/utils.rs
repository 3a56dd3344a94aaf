use blox::{Context, Deferred, Value};
use rand::{Rng, SeedableRng, rngs::StdRng};

/// A profile context: the user's record, a list of rows with nested tags,
/// and the flags the template branches on.
pub struct Profile {
    name: String,
    age: u32,
    active: bool,
    rows: Vec<Row>,
    show_details: bool,
    has_access: bool,
}

struct Row {
    name: String,
    value: u32,
    special: bool,
    tags: Vec<String>,
}

/// Generates `n` profiles from a fixed seed so runs are comparable.
pub fn generate_random_profiles(n: usize) -> Vec<Profile> {
    let mut rng = StdRng::seed_from_u64(42);
    (0..n)
        .map(|_| {
            let rows = (0..rng.random_range(3..10))
                .map(|_| Row {
                    name: random_text(&mut rng, 3, 8),
                    value: rng.random_range(10..1000),
                    special: rng.random_bool(0.3),
                    tags: (0..rng.random_range(0..4))
                        .map(|_| random_text(&mut rng, 2, 5))
                        .collect(),
                })
                .collect();
            Profile {
                name: random_text(&mut rng, 5, 10),
                age: rng.random_range(18..80),
                active: rng.random_bool(0.7),
                rows,
                show_details: rng.random_bool(0.8),
                has_access: rng.random_bool(0.6),
            }
        })
        .collect()
}

impl Profile {
    /// The profile with every value available up front.
    pub fn context(&self) -> Context {
        self.build(|s| Value::string(s))
    }

    /// The same profile with the user's name and every row value behind a
    /// deferred value, so rendering takes the suspending path.
    pub fn deferred_context(&self) -> Context {
        self.build(|text| Value::from(Deferred::new(std::future::ready(Ok(Value::string(text))))))
    }

    fn build(&self, leaf: impl Fn(&str) -> Value) -> Context {
        let rows = self.rows.iter().map(|row| {
            Value::object([
                ("name", Value::string(&row.name)),
                ("value", leaf(&row.value.to_string())),
                ("special", Value::from(row.special)),
                ("tags", Value::array(row.tags.iter().map(Value::string))),
            ])
        });
        Context::new()
            .with(
                "user",
                Value::object([
                    ("name", leaf(&self.name)),
                    ("age", Value::from(self.age)),
                    ("active", Value::from(self.active)),
                ]),
            )
            .with("items", Value::array(rows))
            .with("show_details", self.show_details)
            .with("has_access", self.has_access)
    }
}

/// Lowercase text salted with characters the template has to escape.
fn random_text(rng: &mut StdRng, min_len: usize, max_len: usize) -> String {
    let charset = b"abcdefghijklmnopqrstuvwxyz<>&\"";
    let len = rng.random_range(min_len..=max_len);
    (0..len)
        .map(|_| char::from(charset[rng.random_range(0..charset.len())]))
        .collect()
}
