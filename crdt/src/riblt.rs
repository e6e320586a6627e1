//! Rateless invertible Bloom lookup tables over 16 byte symbols.
//!
//! Two peers each list the op refs their filter selects, then one side
//! streams coded symbols until the other can peel out the symmetric
//! difference. A coded symbol is the XOR aggregate of every source symbol
//! mapped onto it plus a count; subtracting the local aggregate from the
//! received one leaves an invertible sketch of the difference alone. The
//! stream is rateless: cells are generated on demand from a shared seed, so
//! neither side needs to guess the difference size up front.

use blake3::Hasher;

const CHECKSUM_DOMAIN: &[u8] = b"treecrdt/riblt/chk";
const MAPPING_DOMAIN: &[u8] = b"treecrdt/riblt/map";

/// A source symbol: a 16 byte op ref.
pub type Symbol = [u8; 16];

fn checksum(symbol: &Symbol) -> [u8; 16] {
    let mut hasher = Hasher::new();
    hasher.update(CHECKSUM_DOMAIN);
    hasher.update(symbol);
    let mut out = [0; 16];
    out.copy_from_slice(&hasher.finalize().as_bytes()[..16]);
    out
}

fn xor(a: &mut [u8; 16], b: &[u8; 16]) {
    for (a, b) in a.iter_mut().zip(b.iter()) {
        *a ^= b;
    }
}

/// One cell of the coded symbol stream.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CodedSymbol {
    pub count: i64,
    pub key_sum: [u8; 16],
    pub value_sum: [u8; 16],
}

impl CodedSymbol {
    fn apply(&mut self, symbol: &Symbol, direction: i64) {
        self.count += direction;
        xor(&mut self.key_sum, symbol);
        xor(&mut self.value_sum, &checksum(symbol));
    }

    fn is_zero(&self) -> bool {
        self.count == 0 && self.key_sum == [0; 16] && self.value_sum == [0; 16]
    }

    /// A pure cell holds exactly one symbol and can be peeled.
    fn is_pure(&self) -> bool {
        (self.count == 1 || self.count == -1) && checksum(&self.key_sum) == self.value_sum
    }
}

/// Deterministic index sequence of one symbol.
///
/// Every symbol lands in cell 0; subsequent indices grow with random gaps
/// distributed so the density of cell i falls off as 2/(i+2). Both sides
/// derive identical sequences from the shared seed, which is what makes
/// subtraction of the local aggregate meaningful.
struct RandomMapping {
    state: u64,
    last: u64,
}

impl RandomMapping {
    fn new(seed: u64, symbol: &Symbol) -> Self {
        let mut hasher = Hasher::new();
        hasher.update(MAPPING_DOMAIN);
        hasher.update(&seed.to_be_bytes());
        hasher.update(symbol);
        let state = u64::from_be_bytes(hasher.finalize().as_bytes()[..8].try_into().unwrap());
        Self { state, last: 0 }
    }

    fn current(&self) -> u64 {
        self.last
    }

    fn advance(&mut self) -> u64 {
        // splitmix64 step
        self.state = self.state.wrapping_add(0x9e37_79b9_7f4a_7c15);
        let mut z = self.state;
        z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
        let r = z ^ (z >> 31);
        let u = (r as f64 + 1.0) / (u64::MAX as f64 + 2.0);
        let diff = ((self.last as f64 + 1.5) * (1.0 / u.sqrt() - 1.0)).ceil() as u64;
        self.last = self.last.saturating_add(diff.max(1));
        self.last
    }
}

/// Produces the coded symbol stream for one side's symbol set.
pub struct Encoder {
    seed: u64,
    symbols: Vec<(Symbol, RandomMapping)>,
    cells: Vec<CodedSymbol>,
}

impl Encoder {
    pub fn new(seed: u64, symbols: impl IntoIterator<Item = Symbol>) -> Self {
        Self {
            seed,
            symbols: symbols
                .into_iter()
                .map(|s| {
                    let mapping = RandomMapping::new(seed, &s);
                    (s, mapping)
                })
                .collect(),
            cells: Vec::new(),
        }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Extends the stream to `len` cells and returns them all.
    pub fn emit(&mut self, len: usize) -> &[CodedSymbol] {
        while self.cells.len() < len {
            self.cells.push(CodedSymbol::default());
            let idx = self.cells.len() - 1;
            for (symbol, mapping) in self.symbols.iter_mut() {
                while (mapping.current() as usize) < idx {
                    mapping.advance();
                }
                if mapping.current() as usize == idx {
                    self.cells[idx].apply(symbol, 1);
                    mapping.advance();
                }
            }
        }
        &self.cells[..len]
    }
}

/// The two sides of a decoded symmetric difference.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SymmetricDifference {
    /// Symbols only the remote (codeword producing) side has.
    pub remote_only: Vec<Symbol>,
    /// Symbols only the local side has.
    pub local_only: Vec<Symbol>,
    pub codewords_received: usize,
}

/// Subtracts the local set from a received stream and peels the difference.
pub struct Decoder {
    local: Encoder,
    cells: Vec<CodedSymbol>,
    remote_only: Vec<Symbol>,
    local_only: Vec<Symbol>,
}

impl Decoder {
    pub fn new(seed: u64, local_symbols: impl IntoIterator<Item = Symbol>) -> Self {
        Self {
            local: Encoder::new(seed, local_symbols),
            cells: Vec::new(),
            remote_only: Vec::new(),
            local_only: Vec::new(),
        }
    }

    pub fn codewords_received(&self) -> usize {
        self.cells.len()
    }

    /// Feeds the next chunk of the remote stream. Cells must arrive in
    /// stream order without gaps.
    pub fn add_codewords(&mut self, codewords: &[CodedSymbol]) {
        let start = self.cells.len();
        let len = start + codewords.len();
        let local: Vec<CodedSymbol> = self.local.emit(len)[start..].to_vec();
        for (i, remote) in codewords.iter().enumerate() {
            let mut cell = *remote;
            let own = &local[i];
            cell.count -= own.count;
            xor(&mut cell.key_sum, &own.key_sum);
            xor(&mut cell.value_sum, &own.value_sum);
            // replay previously recovered symbols into the new cell
            for symbol in self.remote_only.clone() {
                self.replay(&mut cell, start + i, &symbol, -1);
            }
            for symbol in self.local_only.clone() {
                self.replay(&mut cell, start + i, &symbol, 1);
            }
            self.cells.push(cell);
        }
    }

    fn replay(&self, cell: &mut CodedSymbol, idx: usize, symbol: &Symbol, direction: i64) {
        let mut mapping = RandomMapping::new(self.local.seed, symbol);
        loop {
            let at = mapping.current() as usize;
            if at == idx {
                cell.apply(symbol, direction);
                return;
            }
            if at > idx {
                return;
            }
            mapping.advance();
        }
    }

    fn peel(&mut self, symbol: Symbol, direction: i64) {
        let mut mapping = RandomMapping::new(self.local.seed, &symbol);
        loop {
            let idx = mapping.current() as usize;
            if idx >= self.cells.len() {
                break;
            }
            self.cells[idx].apply(&symbol, direction);
            mapping.advance();
        }
        if direction < 0 {
            self.remote_only.push(symbol);
        } else {
            self.local_only.push(symbol);
        }
    }

    /// Runs the peeling loop. Returns the difference once every cell has
    /// cancelled to zero, `None` while more codewords are needed.
    pub fn try_decode(&mut self) -> Option<SymmetricDifference> {
        loop {
            let pure = self
                .cells
                .iter()
                .position(|cell| cell.is_pure())
                .map(|idx| self.cells[idx]);
            match pure {
                Some(cell) => {
                    // count +1: present remotely, absent locally
                    self.peel(cell.key_sum, -cell.count.signum());
                }
                None => break,
            }
        }
        if !self.cells.is_empty() && self.cells.iter().all(|cell| cell.is_zero()) {
            Some(SymmetricDifference {
                remote_only: self.remote_only.clone(),
                local_only: self.local_only.clone(),
                codewords_received: self.cells.len(),
            })
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sym(i: u64) -> Symbol {
        let mut s = [0; 16];
        s[..8].copy_from_slice(&i.to_be_bytes());
        s
    }

    fn reconcile(
        remote: impl IntoIterator<Item = Symbol>,
        local: impl IntoIterator<Item = Symbol>,
        budget: usize,
    ) -> Option<SymmetricDifference> {
        let seed = 42;
        let mut encoder = Encoder::new(seed, remote);
        let mut decoder = Decoder::new(seed, local);
        let chunk = 8;
        while decoder.codewords_received() < budget {
            let upto = (decoder.codewords_received() + chunk).min(budget);
            let cells = encoder.emit(upto)[decoder.codewords_received()..].to_vec();
            decoder.add_codewords(&cells);
            if let Some(diff) = decoder.try_decode() {
                return Some(diff);
            }
        }
        None
    }

    #[test]
    fn identical_sets_decode_immediately() {
        let set: Vec<_> = (0..50).map(sym).collect();
        let diff = reconcile(set.clone(), set, 64).unwrap();
        assert!(diff.remote_only.is_empty());
        assert!(diff.local_only.is_empty());
    }

    #[test]
    fn small_differences_recovered() {
        let shared: Vec<_> = (0..100).map(sym).collect();
        let mut remote = shared.clone();
        remote.push(sym(1000));
        remote.push(sym(1001));
        let mut local = shared;
        local.push(sym(2000));

        let diff = reconcile(remote, local, 256).unwrap();
        let mut remote_only = diff.remote_only.clone();
        remote_only.sort();
        assert_eq!(remote_only, vec![sym(1000), sym(1001)]);
        assert_eq!(diff.local_only, vec![sym(2000)]);
    }

    #[test]
    fn empty_local_recovers_everything() {
        let remote: Vec<_> = (0..20).map(sym).collect();
        let diff = reconcile(remote.clone(), Vec::new(), 256).unwrap();
        let mut got = diff.remote_only.clone();
        got.sort();
        let mut want = remote;
        want.sort();
        assert_eq!(got, want);
    }

    #[test]
    fn budget_exhaustion_fails() {
        let remote: Vec<_> = (0..200).map(sym).collect();
        assert!(reconcile(remote, Vec::new(), 4).is_none());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]
        #[test]
        fn recovers_random_differences(
            shared in proptest::collection::btree_set(0u64..10_000, 0..64),
            remote_extra in proptest::collection::btree_set(10_000u64..20_000, 0..12),
            local_extra in proptest::collection::btree_set(20_000u64..30_000, 0..12),
        ) {
            let remote: Vec<_> = shared.iter().chain(remote_extra.iter()).map(|i| sym(*i)).collect();
            let local: Vec<_> = shared.iter().chain(local_extra.iter()).map(|i| sym(*i)).collect();
            let diff = reconcile(remote, local, 4096).expect("decodable within budget");
            let mut remote_only = diff.remote_only.clone();
            remote_only.sort();
            let mut want_remote: Vec<_> = remote_extra.iter().map(|i| sym(*i)).collect();
            want_remote.sort();
            prop_assert_eq!(remote_only, want_remote);
            let mut local_only = diff.local_only.clone();
            local_only.sort();
            let mut want_local: Vec<_> = local_extra.iter().map(|i| sym(*i)).collect();
            want_local.sort();
            prop_assert_eq!(local_only, want_local);
        }
    }
}
