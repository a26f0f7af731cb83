//! Double Metaphone phonetic encoder.
//!
//! Names that survive normalisation are reduced to a sound-alike code so the
//! comparator can credit spelling variants (SMITH/SMYTHE, ELIZABETH/ELISABETH)
//! without seeing the surface form. Only the primary encoding is used by the
//! rest of the engine; the alternate is computed because several rules differ
//! only in which output they write to.
//!
//! The encoder expects uppercase input. Characters outside A-Z and space are
//! ignored, which is harmless here because `normalize::normalize_name` strips
//! everything else first.

/// Maximum length of an encoding.
const MAX_CODE_LEN: usize = 4;

/// Primary Double Metaphone code for a name, or `None` when the input
/// yields no code at all. An empty code never matches any other code, so
/// `None` is the correct representation for unencodable input.
pub fn primary(word: &str) -> Option<String> {
    let (primary, _alternate) = encode(word);
    if primary.is_empty() {
        None
    } else {
        Some(primary)
    }
}

/// Compute both Double Metaphone encodings of a word.
pub fn encode(word: &str) -> (String, String) {
    let mut chars: Vec<char> = word
        .chars()
        .flat_map(|c| c.to_uppercase())
        .filter(|c| c.is_ascii_uppercase() || *c == ' ')
        .collect();
    let length = chars.len() as isize;
    if length == 0 {
        return (String::new(), String::new());
    }
    // Pad so lookahead rules near the end of the word read blanks, not garbage.
    chars.extend(std::iter::repeat(' ').take(5));

    Encoder {
        chars,
        length,
        last: length - 1,
        primary: String::new(),
        alternate: String::new(),
    }
    .run()
}

struct Encoder {
    chars: Vec<char>,
    length: isize,
    last: isize,
    primary: String,
    alternate: String,
}

impl Encoder {
    fn get(&self, i: isize) -> char {
        if i < 0 || i >= self.chars.len() as isize {
            '\0'
        } else {
            self.chars[i as usize]
        }
    }

    /// True when the substring of `len` characters starting at `start`
    /// equals any of the given options. Out-of-range reads never match.
    fn at(&self, start: isize, len: usize, options: &[&str]) -> bool {
        if start < 0 || start + len as isize > self.chars.len() as isize {
            return false;
        }
        let slice: String = self.chars[start as usize..start as usize + len].iter().collect();
        options.iter().any(|o| *o == slice)
    }

    fn is_vowel(&self, i: isize) -> bool {
        matches!(self.get(i), 'A' | 'E' | 'I' | 'O' | 'U' | 'Y')
    }

    fn slavo_germanic(&self) -> bool {
        let word: String = self.chars.iter().collect();
        word.contains('W') || word.contains('K') || word.contains("CZ") || word.contains("WITZ")
    }

    fn add(&mut self, primary: &str, alternate: &str) {
        if primary != " " {
            self.primary.push_str(primary);
        }
        if alternate != " " {
            self.alternate.push_str(alternate);
        }
    }

    fn run(mut self) -> (String, String) {
        let slavo = self.slavo_germanic();
        let mut current: isize = 0;

        // Skip a silent initial letter.
        if self.at(0, 2, &["GN", "KN", "PN", "WR", "PS"]) {
            current = 1;
        }
        // Initial X is pronounced Z, which maps to S.
        if self.get(0) == 'X' {
            self.add("S", "S");
            current = 1;
        }

        while (self.primary.len() < MAX_CODE_LEN || self.alternate.len() < MAX_CODE_LEN)
            && current < self.length
        {
            match self.get(current) {
                'A' | 'E' | 'I' | 'O' | 'U' | 'Y' => {
                    if current == 0 {
                        self.add("A", "A");
                    }
                    current += 1;
                }
                'B' => {
                    self.add("P", "P");
                    current += if self.get(current + 1) == 'B' { 2 } else { 1 };
                }
                'C' => current = self.consume_c(current, slavo),
                'D' => {
                    if self.at(current, 2, &["DG"]) {
                        if self.at(current + 2, 1, &["I", "E", "Y"]) {
                            // 'edge'
                            self.add("J", "J");
                            current += 3;
                        } else {
                            // 'edgar'
                            self.add("TK", "TK");
                            current += 2;
                        }
                    } else if self.at(current, 2, &["DT", "DD"]) {
                        self.add("T", "T");
                        current += 2;
                    } else {
                        self.add("T", "T");
                        current += 1;
                    }
                }
                'F' => {
                    self.add("F", "F");
                    current += if self.get(current + 1) == 'F' { 2 } else { 1 };
                }
                'G' => current = self.consume_g(current, slavo),
                'H' => {
                    // Keep only when both surrounded by vowels and not initial.
                    if (current == 0 || self.is_vowel(current - 1)) && self.is_vowel(current + 1) {
                        self.add("H", "H");
                        current += 2;
                    } else {
                        current += 1;
                    }
                }
                'J' => current = self.consume_j(current, slavo),
                'K' => {
                    self.add("K", "K");
                    current += if self.get(current + 1) == 'K' { 2 } else { 1 };
                }
                'L' => {
                    if self.get(current + 1) == 'L' {
                        // Spanish 'cabrillo', 'gallegos'
                        if (current == self.length - 3
                            && self.at(current - 1, 4, &["ILLO", "ILLA", "ALLE"]))
                            || ((self.at(self.last - 1, 2, &["AS", "OS"])
                                || self.at(self.last, 1, &["A", "O"]))
                                && self.at(current - 1, 4, &["ALLE"]))
                        {
                            self.add("L", "");
                        } else {
                            self.add("L", "L");
                        }
                        current += 2;
                    } else {
                        self.add("L", "L");
                        current += 1;
                    }
                }
                'M' => {
                    if (self.at(current - 1, 3, &["UMB"])
                        && (current + 1 == self.last || self.at(current + 2, 2, &["ER"])))
                        || self.get(current + 1) == 'M'
                    {
                        current += 2;
                    } else {
                        current += 1;
                    }
                    self.add("M", "M");
                }
                'N' => {
                    self.add("N", "N");
                    current += if self.get(current + 1) == 'N' { 2 } else { 1 };
                }
                'P' => {
                    if self.get(current + 1) == 'H' {
                        self.add("F", "F");
                        current += 2;
                    } else {
                        current += if self.at(current + 1, 1, &["P", "B"]) { 2 } else { 1 };
                        self.add("P", "P");
                    }
                }
                'Q' => {
                    self.add("K", "K");
                    current += if self.get(current + 1) == 'Q' { 2 } else { 1 };
                }
                'R' => {
                    // French 'rogier', but exclude 'hochmeier'
                    if current == self.last
                        && !slavo
                        && self.at(current - 2, 2, &["IE"])
                        && !self.at(current - 4, 2, &["ME", "MA"])
                    {
                        self.add("", "R");
                    } else {
                        self.add("R", "R");
                    }
                    current += if self.get(current + 1) == 'R' { 2 } else { 1 };
                }
                'S' => current = self.consume_s(current, slavo),
                'T' => {
                    if self.at(current, 4, &["TION"]) {
                        self.add("X", "X");
                        current += 3;
                    } else if self.at(current, 3, &["TIA", "TCH"]) {
                        self.add("X", "X");
                        current += 3;
                    } else if self.at(current, 2, &["TH"]) || self.at(current, 3, &["TTH"]) {
                        // 'thomas', 'thames' or germanic
                        if self.at(current + 2, 2, &["OM", "AM"])
                            || self.at(0, 4, &["VAN ", "VON "])
                            || self.at(0, 3, &["SCH"])
                        {
                            self.add("T", "T");
                        } else {
                            self.add("0", "T");
                        }
                        current += 2;
                    } else {
                        current += if self.at(current + 1, 1, &["T", "D"]) { 2 } else { 1 };
                        self.add("T", "T");
                    }
                }
                'V' => {
                    self.add("F", "F");
                    current += if self.get(current + 1) == 'V' { 2 } else { 1 };
                }
                'W' => current = self.consume_w(current),
                'X' => {
                    // French 'breaux'
                    if !(current == self.last
                        && (self.at(current - 3, 3, &["IAU", "EAU"])
                            || self.at(current - 2, 2, &["AU", "OU"])))
                    {
                        self.add("KS", "KS");
                    }
                    current += if self.at(current + 1, 1, &["C", "X"]) { 2 } else { 1 };
                }
                'Z' => {
                    if self.get(current + 1) == 'H' {
                        // Chinese pinyin e.g. 'zhao'
                        self.add("J", "J");
                        current += 2;
                    } else {
                        if self.at(current + 1, 2, &["ZO", "ZI", "ZA"])
                            || (slavo && current > 0 && self.get(current - 1) != 'T')
                        {
                            self.add("S", "TS");
                        } else {
                            self.add("S", "S");
                        }
                        current += if self.get(current + 1) == 'Z' { 2 } else { 1 };
                    }
                }
                _ => current += 1,
            }
        }

        self.primary.truncate(MAX_CODE_LEN);
        self.alternate.truncate(MAX_CODE_LEN);
        (self.primary, self.alternate)
    }

    fn consume_c(&mut self, current: isize, _slavo: bool) -> isize {
        // Various germanic sequences, e.g. 'wachtler'
        if current > 1
            && !self.is_vowel(current - 2)
            && self.at(current - 1, 3, &["ACH"])
            && self.get(current + 2) != 'I'
            && (self.get(current + 2) != 'E' || self.at(current - 2, 6, &["BACHER", "MACHER"]))
        {
            self.add("K", "K");
            return current + 2;
        }
        if current == 0 && self.at(current, 6, &["CAESAR"]) {
            self.add("S", "S");
            return current + 2;
        }
        // Italian 'chianti'
        if self.at(current, 4, &["CHIA"]) {
            self.add("K", "K");
            return current + 2;
        }
        if self.at(current, 2, &["CH"]) {
            // 'michael'
            if current > 0 && self.at(current, 4, &["CHAE"]) {
                self.add("K", "X");
                return current + 2;
            }
            // Greek roots e.g. 'chemistry', 'chorus'
            if current == 0
                && (self.at(current + 1, 5, &["HARAC", "HARIS"])
                    || self.at(current + 1, 3, &["HOR", "HYM", "HIA", "HEM"]))
                && !self.at(0, 5, &["CHORE"])
            {
                self.add("K", "K");
                return current + 2;
            }
            // Germanic, greek, or otherwise 'ch' for 'kh'
            if (self.at(0, 4, &["VAN ", "VON "]) || self.at(0, 3, &["SCH"]))
                || self.at(current - 2, 6, &["ORCHES", "ARCHIT", "ORCHID"])
                || self.at(current + 2, 1, &["T", "S"])
                || ((self.at(current - 1, 1, &["A", "O", "U", "E"]) || current == 0)
                    && self.at(current + 2, 1, &["L", "R", "N", "M", "B", "H", "F", "V", "W", " "]))
            {
                self.add("K", "K");
            } else if current > 0 {
                if self.at(0, 2, &["MC"]) {
                    self.add("K", "K");
                } else {
                    self.add("X", "K");
                }
            } else {
                self.add("X", "X");
            }
            return current + 2;
        }
        // 'czerny'
        if self.at(current, 2, &["CZ"]) && !self.at(current - 2, 4, &["WICZ"]) {
            self.add("S", "X");
            return current + 2;
        }
        // 'focaccia'
        if self.at(current + 1, 3, &["CIA"]) {
            self.add("X", "X");
            return current + 3;
        }
        // Double C, but not 'McClellan'
        if self.at(current, 2, &["CC"]) && !(current == 1 && self.get(0) == 'M') {
            if self.at(current + 2, 1, &["I", "E", "H"]) && !self.at(current + 2, 2, &["HU"]) {
                // 'accident', 'succeed' vs 'bellocchio'
                if (current == 1 && self.get(current - 1) == 'A')
                    || self.at(current - 1, 5, &["UCCEE", "UCCES"])
                {
                    self.add("KS", "KS");
                } else {
                    self.add("X", "X");
                }
                return current + 3;
            }
            self.add("K", "K");
            return current + 2;
        }
        if self.at(current, 2, &["CK", "CG", "CQ"]) {
            self.add("K", "K");
            return current + 2;
        }
        if self.at(current, 2, &["CI", "CE", "CY"]) {
            // Italian vs systematic soft C
            if self.at(current, 3, &["CIO", "CIE", "CIA"]) {
                self.add("S", "X");
            } else {
                self.add("S", "S");
            }
            return current + 2;
        }
        self.add("K", "K");
        // 'mac caffrey', 'mac gregor'
        if self.at(current + 1, 2, &[" C", " Q", " G"]) {
            current + 3
        } else if self.at(current + 1, 1, &["C", "K", "Q"])
            && !self.at(current + 1, 2, &["CE", "CI"])
        {
            current + 2
        } else {
            current + 1
        }
    }

    fn consume_g(&mut self, current: isize, slavo: bool) -> isize {
        if self.get(current + 1) == 'H' {
            if current > 0 && !self.is_vowel(current - 1) {
                self.add("K", "K");
                return current + 2;
            }
            if current == 0 {
                // 'ghislane' vs 'ghoul'
                if self.get(current + 2) == 'I' {
                    self.add("J", "J");
                } else {
                    self.add("K", "K");
                }
                return current + 2;
            }
            // Parker's rule: silent after B, H, D a few positions back
            if (current > 1 && self.at(current - 2, 1, &["B", "H", "D"]))
                || (current > 2 && self.at(current - 3, 1, &["B", "H", "D"]))
                || (current > 3 && self.at(current - 4, 1, &["B", "H"]))
            {
                return current + 2;
            }
            // 'laugh', 'cough'
            if current > 2
                && self.get(current - 1) == 'U'
                && self.at(current - 3, 1, &["C", "G", "L", "R", "T"])
            {
                self.add("F", "F");
            } else if current > 0 && self.get(current - 1) != 'I' {
                self.add("K", "K");
            }
            return current + 2;
        }
        if self.get(current + 1) == 'N' {
            if current == 1 && self.is_vowel(0) && !slavo {
                self.add("KN", "N");
            } else if !self.at(current + 2, 2, &["EY"]) && !slavo {
                // not e.g. 'cagney'
                self.add("N", "KN");
            } else {
                self.add("KN", "KN");
            }
            return current + 2;
        }
        // 'tagliaro'
        if self.at(current + 1, 2, &["LI"]) && !slavo {
            self.add("KL", "L");
            return current + 2;
        }
        // -ges-, -gep-, -gel- at the beginning
        if current == 0
            && (self.get(current + 1) == 'Y'
                || self.at(
                    current + 1,
                    2,
                    &["ES", "EP", "EB", "EL", "EY", "IB", "IL", "IN", "IE", "EI", "ER"],
                ))
        {
            self.add("K", "J");
            return current + 2;
        }
        // -ger-, -gy-
        if (self.at(current + 1, 2, &["ER"]) || self.get(current + 1) == 'Y')
            && !self.at(0, 6, &["DANGER", "RANGER", "MANGER"])
            && !self.at(current - 1, 1, &["E", "I"])
            && !self.at(current - 1, 3, &["RGY", "OGY"])
        {
            self.add("K", "J");
            return current + 2;
        }
        // Italian e.g. 'biaggi'
        if self.at(current + 1, 1, &["E", "I", "Y"]) || self.at(current - 1, 4, &["AGGI", "OGGI"]) {
            if (self.at(0, 4, &["VAN ", "VON "]) || self.at(0, 3, &["SCH"]))
                || self.at(current + 1, 2, &["ET"])
            {
                self.add("K", "K");
            } else if self.at(current + 1, 4, &["IER "]) {
                self.add("J", "J");
            } else {
                self.add("J", "K");
            }
            return current + 2;
        }
        let next = if self.get(current + 1) == 'G' { current + 2 } else { current + 1 };
        self.add("K", "K");
        next
    }

    fn consume_j(&mut self, current: isize, slavo: bool) -> isize {
        // Obvious spanish, 'jose', 'san jacinto'
        if self.at(current, 4, &["JOSE"]) || self.at(0, 4, &["SAN "]) {
            if (current == 0 && self.get(current + 4) == ' ') || self.at(0, 4, &["SAN "]) {
                self.add("H", "H");
            } else {
                self.add("J", "H");
            }
            return current + 1;
        }
        if current == 0 {
            // Yankelovich / Jankelowicz
            self.add("J", "A");
        } else if self.is_vowel(current - 1)
            && !slavo
            && (self.get(current + 1) == 'A' || self.get(current + 1) == 'O')
        {
            // Spanish pronunciation, e.g. 'bajador'
            self.add("J", "H");
        } else if current == self.last {
            self.add("J", " ");
        } else if !self
            .at(current + 1, 1, &["L", "T", "K", "S", "N", "M", "B", "Z"])
            && !self.at(current - 1, 1, &["S", "K", "L"])
        {
            self.add("J", "J");
        }
        if self.get(current + 1) == 'J' {
            current + 2
        } else {
            current + 1
        }
    }

    fn consume_s(&mut self, current: isize, slavo: bool) -> isize {
        // Silent in 'island', 'isle', 'carlisle'
        if self.at(current - 1, 3, &["ISL", "YSL"]) {
            return current + 1;
        }
        if current == 0 && self.at(current, 5, &["SUGAR"]) {
            self.add("X", "S");
            return current + 1;
        }
        if self.at(current, 2, &["SH"]) {
            // Germanic
            if self.at(current + 1, 4, &["HEIM", "HOEK", "HOLM", "HOLZ"]) {
                self.add("S", "S");
            } else {
                self.add("X", "X");
            }
            return current + 2;
        }
        // Italian and armenian
        if self.at(current, 3, &["SIO", "SIA"]) || self.at(current, 4, &["SIAN"]) {
            if !slavo {
                self.add("S", "X");
            } else {
                self.add("S", "S");
            }
            return current + 3;
        }
        // Anglicisations ('smith' matches 'schmidt') and slavic -sz-
        if (current == 0 && self.at(current + 1, 1, &["M", "N", "L", "W"]))
            || self.at(current + 1, 1, &["Z"])
        {
            self.add("S", "X");
            return if self.at(current + 1, 1, &["Z"]) { current + 2 } else { current + 1 };
        }
        if self.at(current, 2, &["SC"]) {
            if self.get(current + 2) == 'H' {
                // Dutch origin, e.g. 'school', 'schooner'
                if self.at(current + 3, 2, &["OO", "ER", "EN", "UY", "ED", "EM"]) {
                    // 'schermerhorn', 'schenker'
                    if self.at(current + 3, 2, &["ER", "EN"]) {
                        self.add("X", "SK");
                    } else {
                        self.add("SK", "SK");
                    }
                } else if current == 0 && !self.is_vowel(3) && self.get(3) != 'W' {
                    self.add("X", "S");
                } else {
                    self.add("X", "X");
                }
                return current + 3;
            }
            if self.at(current + 2, 1, &["I", "E", "Y"]) {
                self.add("S", "S");
            } else {
                self.add("SK", "SK");
            }
            return current + 3;
        }
        // French e.g. 'resnais', 'artois'
        if current == self.last && self.at(current - 2, 2, &["AI", "OI"]) {
            self.add("", "S");
        } else {
            self.add("S", "S");
        }
        if self.at(current + 1, 1, &["S", "Z"]) {
            current + 2
        } else {
            current + 1
        }
    }

    fn consume_w(&mut self, current: isize) -> isize {
        // Can also be in the middle of a word
        if self.at(current, 2, &["WR"]) {
            self.add("R", "R");
            return current + 2;
        }
        if current == 0 && (self.is_vowel(current + 1) || self.at(current, 2, &["WH"])) {
            if self.is_vowel(current + 1) {
                // 'wasserman' alternates to 'vasserman'
                self.add("A", "F");
            } else {
                self.add("A", "A");
            }
            return current + 1;
        }
        // 'arnow' alternates to 'arnoff'
        if (current == self.last && self.is_vowel(current - 1))
            || self.at(current - 1, 5, &["EWSKI", "EWSKY", "OWSKI", "OWSKY"])
            || self.at(0, 3, &["SCH"])
        {
            self.add("", "F");
            return current + 1;
        }
        // Polish e.g. 'filipowicz'
        if self.at(current, 4, &["WICZ", "WITZ"]) {
            self.add("TS", "FX");
            return current + 4;
        }
        current + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spelling_variants_share_a_code() {
        assert_eq!(primary("SMITH").as_deref(), Some("SM0"));
        assert_eq!(primary("SMYTHE").as_deref(), Some("SM0"));
        assert_eq!(primary("ELIZABETH").as_deref(), Some("ALSP"));
        assert_eq!(primary("ELISABETH").as_deref(), Some("ALSP"));
        assert_eq!(primary("KATHERINE"), primary("CATHERINE"));
    }

    #[test]
    fn test_distinct_names_get_distinct_codes() {
        assert_eq!(primary("JONES").as_deref(), Some("JNS"));
        assert_ne!(primary("SMITH"), primary("JONES"));
    }

    #[test]
    fn test_silent_letters() {
        // WR- loses the W, -GH- after a vowel is silent.
        assert_eq!(primary("WRIGHT").as_deref(), Some("RT"));
        // KN- loses the K.
        assert_eq!(primary("KNIGHT"), primary("NIGHT"));
    }

    #[test]
    fn test_ph_sounds_like_f() {
        assert_eq!(primary("PHILIPS").as_deref(), Some("FLPS"));
    }

    #[test]
    fn test_code_is_capped_at_four() {
        let code = primary("CONSTANTINOPOLIS").unwrap();
        assert!(code.len() <= 4);
    }

    #[test]
    fn test_empty_and_unencodable_input() {
        assert_eq!(primary(""), None);
        assert_eq!(primary("   "), None);
    }

    #[test]
    fn test_lowercase_input_is_folded() {
        assert_eq!(primary("smith"), primary("SMITH"));
    }

    #[test]
    fn test_alternate_is_computed_but_unused() {
        let (p, a) = encode("SMITH");
        assert_eq!(p, "SM0");
        // Anglicisation rule: 'smith' alternates towards 'schmidt'.
        assert_eq!(a, "XMT");
    }
}
