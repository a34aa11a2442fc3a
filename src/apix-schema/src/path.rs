use std::fmt;

/// accumulator for the field position of a failure, rendered in the
/// `spec.template.containers[2].name` form
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldPath {
    segments: Vec<Segment>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Field(String),
    Index(usize),
}

impl FieldPath {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn field(name: &str) -> Self {
        Self {
            segments: vec![Segment::Field(name.to_owned())],
        }
    }

    pub fn child(&self, name: &str) -> Self {
        let mut segments = self.segments.clone();
        segments.push(Segment::Field(name.to_owned()));
        Self { segments }
    }

    pub fn index(&self, idx: usize) -> Self {
        let mut segments = self.segments.clone();
        segments.push(Segment::Index(idx));
        Self { segments }
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// append a dotted relative path such as the `fieldPath` a rule carries
    pub fn join(&self, relative: &str) -> Self {
        let mut path = self.clone();
        for part in relative.trim_start_matches('.').split('.') {
            if part.is_empty() {
                continue;
            }
            path = path.child(part);
        }
        path
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut first = true;
        for segment in &self.segments {
            match segment {
                Segment::Field(name) => {
                    if !first {
                        write!(f, ".")?;
                    }
                    write!(f, "{name}")?;
                }
                Segment::Index(idx) => write!(f, "[{idx}]")?,
            }
            first = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {

    use super::FieldPath;

    #[test]
    fn test_rendering() {
        let path = FieldPath::field("spec").child("items").index(2).child("name");
        assert_eq!(path.to_string(), "spec.items[2].name");
        assert_eq!(FieldPath::root().to_string(), "");
    }

    #[test]
    fn test_join() {
        let path = FieldPath::field("spec").join(".replicas");
        assert_eq!(path.to_string(), "spec.replicas");
        let path = FieldPath::field("spec").join("template.name");
        assert_eq!(path.to_string(), "spec.template.name");
    }
}
