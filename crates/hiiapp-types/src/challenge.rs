use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A single-use proof-of-work challenge that has to be solved before a phone
/// number may be submitted for verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeTicket {
    pub id: String,
    /// Hex-encoded random nonce.
    pub nonce: String,
    /// Required number of leading zero bits in the digest.
    pub difficulty: u32,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeSolution {
    pub challenge_id: String,
    pub counter: u64,
}

impl ChallengeTicket {
    pub fn solve(&self) -> ChallengeSolution {
        let mut counter = 0u64;
        while !verify(&self.nonce, counter, self.difficulty) {
            counter += 1;
        }
        ChallengeSolution {
            challenge_id: self.id.clone(),
            counter,
        }
    }
}

pub fn verify(nonce: &str, counter: u64, difficulty: u32) -> bool {
    let mut hasher = Sha256::new();
    hasher.update(nonce.as_bytes());
    hasher.update(counter.to_le_bytes());
    leading_zero_bits(&hasher.finalize()) >= difficulty
}

fn leading_zero_bits(digest: &[u8]) -> u32 {
    let mut bits = 0;
    for byte in digest {
        if *byte == 0 {
            bits += 8;
        } else {
            bits += byte.leading_zeros();
            break;
        }
    }
    bits
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn solved_ticket_verifies() {
        let ticket = ChallengeTicket {
            id: "c1".into(),
            nonce: "00ff00ff".into(),
            difficulty: 8,
            expires_at: Utc::now(),
        };
        let solution = ticket.solve();
        assert_eq!(solution.challenge_id, "c1");
        assert!(verify(&ticket.nonce, solution.counter, ticket.difficulty));
    }

    #[test]
    fn counts_leading_zero_bits() {
        assert_eq!(leading_zero_bits(&[0, 0x10, 0xff]), 11);
        assert_eq!(leading_zero_bits(&[0x80]), 0);
        assert_eq!(leading_zero_bits(&[0, 0]), 16);
    }
}
