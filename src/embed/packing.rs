/// Rough token count used for budgeting: a quarter of the character count, plus one.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count() / 4 + 1
}

/// A run of texts sent in one provider call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    /// Positions into the slice given to [`pack_by_budget`].
    pub members: Vec<usize>,
    pub tokens: usize,
}

/// Greedy packing in input order. A group closes when the next text would push
/// it past `token_budget` or past `max_items`. A text that alone exceeds the
/// budget gets a group of its own.
pub fn pack_by_budget(texts: &[&str], token_budget: usize, max_items: usize) -> Vec<Group> {
    let max_items = max_items.max(1);
    let mut groups = Vec::new();
    let mut current = Group {
        members: Vec::new(),
        tokens: 0,
    };

    for (pos, text) in texts.iter().enumerate() {
        let tokens = estimate_tokens(text);
        let overflow = current.tokens + tokens > token_budget || current.members.len() >= max_items;
        if !current.members.is_empty() && overflow {
            groups.push(std::mem::replace(
                &mut current,
                Group {
                    members: Vec::new(),
                    tokens: 0,
                },
            ));
        }
        current.members.push(pos);
        current.tokens += tokens;
    }

    if !current.members.is_empty() {
        groups.push(current);
    }
    groups
}
