use proptest::prelude::*;
use quire::ot::utf16_len;
use quire::session::DocumentState;
use quire::OperationSeq;

/// A random edit, resolved against whatever text it ends up being applied to
#[derive(Debug, Clone)]
struct EditSeed {
    delete: bool,
    pos: usize,
    count: usize,
    text: String,
}

fn edit_seed() -> impl Strategy<Value = EditSeed> {
    (any::<bool>(), 0..64usize, 0..8usize, "[a-zé😀]{1,3}").prop_map(|(delete, pos, count, text)| {
        EditSeed {
            delete,
            pos,
            count,
            text,
        }
    })
}

fn build(seed: &EditSeed, text: &str) -> OperationSeq {
    // Positions are counted in chars so they never split a surrogate pair
    let chars: Vec<char> = text.chars().collect();
    let offset = |n: usize| utf16_len(&chars[..n].iter().collect::<String>());
    let len = utf16_len(text);
    let mut op = OperationSeq::new();

    if seed.delete && !chars.is_empty() {
        let start = seed.pos % chars.len();
        let end = start + 1 + seed.count % (chars.len() - start);
        op.retain(offset(start))
            .delete(offset(end) - offset(start))
            .retain(len - offset(end));
    } else {
        let at = offset(seed.pos % (chars.len() + 1));
        op.retain(at).insert(&seed.text).retain(len - at);
    }
    op
}

proptest! {
    #[test]
    fn transform_converges(text in "[a-z😀]{0,12}", a in edit_seed(), b in edit_seed()) {
        let a = build(&a, &text);
        let b = build(&b, &text);
        let (a_prime, b_prime) = a.transform(&b).unwrap();

        let via_a = b_prime.apply(&a.apply(&text).unwrap()).unwrap();
        let via_b = a_prime.apply(&b.apply(&text).unwrap()).unwrap();
        prop_assert_eq!(via_a, via_b);
    }

    #[test]
    fn compose_matches_sequential_apply(text in "[a-z😀]{0,12}", a in edit_seed(), b in edit_seed()) {
        let a = build(&a, &text);
        let middle = a.apply(&text).unwrap();
        let b = build(&b, &middle);

        let composed = a.compose(&b).unwrap();
        prop_assert_eq!(composed.apply(&text).unwrap(), b.apply(&middle).unwrap());
    }

    #[test]
    fn replicas_converge_with_session(
        text in "[a-z]{0,8}",
        steps in prop::collection::vec((0..3usize, any::<bool>(), edit_seed()), 1..40),
    ) {
        let mut server = DocumentState::new(text.clone());
        let mut log: Vec<(usize, OperationSeq)> = Vec::new();
        let mut clients: Vec<Replica> = (0..3).map(|_| Replica::new(&text)).collect();

        for (who, edit, seed) in &steps {
            let client = &mut clients[*who];
            if *edit && client.outstanding.is_none() {
                let op = build(seed, &client.text);
                client.text = op.apply(&client.text).unwrap();
                client.outstanding = Some(op.clone());
                let effective = server.apply_edit(client.revision, op).unwrap();
                log.push((*who, effective));
            } else {
                client.deliver(*who, &log);
            }
        }

        for (who, client) in clients.iter_mut().enumerate() {
            while client.revision < log.len() as u64 {
                client.deliver(who, &log);
            }
            prop_assert_eq!(&client.text, server.text());
            prop_assert!(client.outstanding.is_none());
        }
        prop_assert_eq!(server.revision(), log.len() as u64);
    }
}

/// A client that keeps at most one unacknowledged edit in flight
struct Replica {
    text: String,
    revision: u64,
    outstanding: Option<OperationSeq>,
}

impl Replica {
    fn new(text: &str) -> Self {
        Self {
            text: text.to_string(),
            revision: 0,
            outstanding: None,
        }
    }

    /// Receive the next entry of the server log, if any
    fn deliver(&mut self, me: usize, log: &[(usize, OperationSeq)]) {
        let Some((author, op)) = log.get(self.revision as usize) else {
            return;
        };
        self.revision += 1;

        if *author == me {
            self.outstanding = None;
            return;
        }
        match self.outstanding.take() {
            Some(pending) => {
                let (remote, pending) = op.transform(&pending).unwrap();
                self.text = remote.apply(&self.text).unwrap();
                self.outstanding = Some(pending);
            }
            None => self.text = op.apply(&self.text).unwrap(),
        }
    }
}

#[test]
fn concurrent_insert_and_append() {
    let mut server = DocumentState::new("ab");

    let mut a = OperationSeq::new();
    a.insert("X").retain(2);
    let mut b = OperationSeq::new();
    b.retain(2).insert("Y");

    server.apply_edit(0, a).unwrap();
    let effective_b = server.apply_edit(0, b).unwrap();

    let mut shifted = OperationSeq::new();
    shifted.retain(3).insert("Y");
    assert_eq!(effective_b, shifted);
    assert_eq!(server.text(), "XabY");
    assert_eq!(server.revision(), 2);
}
