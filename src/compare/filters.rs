/// Text normalization filters applied before comparison

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Filter {
    /// Case-fold to lowercase
    Lower,
    /// Strip leading and trailing whitespace of the whole text
    Strip,
    /// Strip trailing whitespace of every line
    RStrip,
    /// Replace every run of whitespace with a single space
    CollapseWhitespace,
}

impl Filter {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "lower" | "lowercase" => Some(Filter::Lower),
            "strip" | "trim" => Some(Filter::Strip),
            "rstrip" => Some(Filter::RStrip),
            "collapse_whitespace" | "ignore_whitespace" => Some(Filter::CollapseWhitespace),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Filter::Lower => "lower",
            Filter::Strip => "strip",
            Filter::RStrip => "rstrip",
            Filter::CollapseWhitespace => "collapse_whitespace",
        }
    }

    pub fn apply(&self, text: &str) -> String {
        match self {
            Filter::Lower => text.to_lowercase(),
            Filter::Strip => text.trim().to_string(),
            Filter::RStrip => {
                let mut out = text
                    .lines()
                    .map(str::trim_end)
                    .collect::<Vec<_>>()
                    .join("\n");
                if text.ends_with('\n') {
                    out.push('\n');
                }
                out
            }
            Filter::CollapseWhitespace => text.split_whitespace().collect::<Vec<_>>().join(" "),
        }
    }
}

/// Ordered filter list; order matters and is preserved as configured
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FilterChain {
    filters: Vec<Filter>,
}

impl FilterChain {
    pub fn new(filters: Vec<Filter>) -> Self {
        Self { filters }
    }

    /// Build from names; unknown names are reported and skipped
    pub fn from_names<S: AsRef<str>>(names: &[S], warnings: &mut Vec<String>) -> Self {
        let mut filters = Vec::with_capacity(names.len());
        for name in names {
            match Filter::from_name(name.as_ref()) {
                Some(filter) => filters.push(filter),
                None => warnings.push(format!("unknown filter '{}' ignored", name.as_ref())),
            }
        }
        Self { filters }
    }

    pub fn apply(&self, text: &str) -> String {
        self.filters
            .iter()
            .fold(text.to_string(), |acc, filter| filter.apply(&acc))
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }
}
